use bytes::BytesMut;
use ffmpeg_next::frame::Video as AvFrame;

use super::{pixel, pixel_format};
use crate::{
    error::{Result, TranscodeError},
    frame::{FrameData, VideoFrame},
    stream::PixelFormat,
};

/// `(rows, bytes per row)` of each plane of a tightly packed image.
fn planes(format: PixelFormat, width: u32, height: u32) -> Vec<(usize, usize)> {
    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Rgba | PixelFormat::Bgra => vec![(h, w * 4)],
        PixelFormat::Rgb24 => vec![(h, w * 3)],
        PixelFormat::Nv12 => vec![(h, w), (h / 2, w / 2 * 2)],
        PixelFormat::Yuv420p => vec![(h, w), (h / 2, w / 2), (h / 2, w / 2)],
        _ => Vec::new(),
    }
}

/// Copies a CPU frame into a freshly allocated `AVFrame`.
pub(super) fn to_av(frame: &VideoFrame) -> Result<AvFrame> {
    let FrameData::Cpu(data) = &frame.data else {
        return Err(TranscodeError::Transient(
            "surface frames cannot be uploaded by this stage".to_string(),
        ));
    };
    let layout = planes(frame.format, frame.width, frame.height);
    if layout.is_empty() {
        return Err(TranscodeError::invalid(format!(
            "pixel format {:?} not convertible",
            frame.format
        )));
    }
    let needed: usize = layout.iter().map(|(rows, row)| rows * row).sum();
    if data.len() < needed {
        return Err(TranscodeError::invalid(format!(
            "frame holds {} bytes, {} needed",
            data.len(),
            needed
        )));
    }

    let mut av = AvFrame::new(pixel(frame.format), frame.width, frame.height);
    let mut offset = 0;
    for (plane, (rows, row)) in layout.into_iter().enumerate() {
        let stride = av.stride(plane);
        let dst = av.data_mut(plane);
        for y in 0..rows {
            dst[y * stride..y * stride + row].copy_from_slice(&data[offset..offset + row]);
            offset += row;
        }
    }
    av.set_pts(frame.pts);
    Ok(av)
}

/// Copies an `AVFrame` out into a tightly packed CPU frame.
pub(super) fn from_av(av: &AvFrame) -> Result<VideoFrame> {
    let format = pixel_format(av.format());
    let layout = planes(format, av.width(), av.height());
    if layout.is_empty() {
        return Err(TranscodeError::Transient(format!(
            "decoded pixel format {:?} not supported",
            av.format()
        )));
    }
    let mut out = BytesMut::with_capacity(format.buffer_size(av.width(), av.height()));
    for (plane, (rows, row)) in layout.into_iter().enumerate() {
        let stride = av.stride(plane);
        let src = av.data(plane);
        for y in 0..rows {
            out.extend_from_slice(&src[y * stride..y * stride + row]);
        }
    }
    let mut frame = VideoFrame::cpu(out.freeze(), av.width(), av.height(), format);
    frame.pts = av.pts();
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn planar_frames_survive_stride_padding() {
        crate::init().unwrap();
        let (w, h) = (6u32, 4u32);
        let size = PixelFormat::Yuv420p.buffer_size(w, h);
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        let mut frame = VideoFrame::cpu(Bytes::from(data.clone()), w, h, PixelFormat::Yuv420p);
        frame.pts = Some(42);

        let av = to_av(&frame).unwrap();
        assert!(av.stride(0) >= w as usize);
        let back = from_av(&av).unwrap();
        assert_eq!(back.cpu_data().unwrap().as_ref(), data.as_slice());
        assert_eq!(back.pts, Some(42));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let frame = VideoFrame::cpu(Bytes::from_static(&[0; 8]), 4, 4, PixelFormat::Rgba);
        assert!(matches!(to_av(&frame), Err(TranscodeError::InvalidArgument(_))));
    }
}
