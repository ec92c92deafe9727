use std::collections::VecDeque;

use ffmpeg_next::ffi;

use super::{av_error, codec_id, frame::from_av, pixel};
use crate::{
    backend::DecoderStage,
    directive::Directive,
    error::{Result, TranscodeError},
    frame::VideoFrame,
    packet::{Packet, Payload},
    stream::StreamDescriptor,
};

pub struct AvDecoder {
    descriptor: StreamDescriptor,
    decoder: ffmpeg_next::decoder::Video,
    /// Per-packet side data, handed to frames in decode order.
    side_data: VecDeque<Vec<Directive>>,
}

impl AvDecoder {
    pub fn new(stream: &StreamDescriptor) -> Result<Self> {
        let id = codec_id(stream.codec).ok_or_else(|| {
            TranscodeError::invalid(format!("no decoder for codec {}", stream.codec.name()))
        })?;
        let codec = ffmpeg_next::decoder::find(id).ok_or_else(|| {
            TranscodeError::Transient(format!("decoder {} not available", stream.codec.name()))
        })?;
        let mut ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).width = stream.width as i32;
            (*raw).height = stream.height as i32;
            (*raw).pix_fmt = pixel(stream.pixel_format).into();
            (*raw).time_base = ffi::AVRational {
                num: stream.time_base.numerator(),
                den: stream.time_base.denominator(),
            };
        }
        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| av_error(e, false, "open decoder"))?;
        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(TranscodeError::invalid("missing codec parameters"));
        }
        log::debug!(
            "libav decoder {} {}x{}",
            codec.name(),
            decoder.width(),
            decoder.height()
        );
        Ok(Self {
            descriptor: stream.clone(),
            decoder,
            side_data: VecDeque::new(),
        })
    }
}

impl DecoderStage for AvDecoder {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn write(&mut self, packet: Option<Packet>) -> Result<()> {
        let Some(mut packet) = packet else {
            return self
                .decoder
                .send_eof()
                .map_err(|e| av_error(e, false, "decoder eof"));
        };
        if matches!(packet.payload(), Payload::Surface(_)) {
            return Err(TranscodeError::Transient(
                "surface packets cannot be decoded by libav".to_string(),
            ));
        }
        let mut av = ffmpeg_next::Packet::copy(&packet.data());
        av.set_pts(packet.pts());
        av.set_dts(packet.dts());
        self.decoder
            .send_packet(&av)
            .map_err(|e| av_error(e, false, "send packet"))?;
        self.side_data.push_back(packet.take_side_data());
        Ok(())
    }

    fn read(&mut self) -> Result<Option<VideoFrame>> {
        let mut av = ffmpeg_next::frame::Video::empty();
        match self.decoder.receive_frame(&mut av) {
            Ok(()) => {
                let mut frame = from_av(&av)?;
                frame.side_data = self.side_data.pop_front().unwrap_or_default();
                Ok(Some(frame))
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(err) => Err(av_error(err, false, "receive frame")),
        }
    }
}
