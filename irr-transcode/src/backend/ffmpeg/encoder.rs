use std::collections::VecDeque;
use std::ffi::{CString, c_void};

use bytes::Bytes;
use ffmpeg_next::{Dictionary, ffi, picture};

use super::{
    av_error,
    frame::to_av,
    hw::{find_hw_encoder, is_hardware_encoder, software_encoder},
    pixel,
};
use crate::{
    backend::{EncoderOptions, EncoderStage},
    directive::{Directive, Roi},
    error::{Result, TranscodeError},
    frame::VideoFrame,
    packet::{Packet, Payload},
    params::MAX_QP,
    stream::{Rational, StreamDescriptor},
};

/// UUID prefixed to display-control user data in unregistered SEI messages.
const USER_DATA_UUID: [u8; 16] = *b"irr-display-ctrl";

type OpenedEncoder = ffmpeg_next::codec::encoder::video::Encoder;

pub struct AvEncoder {
    descriptor: StreamDescriptor,
    encoder: OpenedEncoder,
    name: String,
    hardware: bool,
    framerate: u32,
    frame_index: u64,
    packets: VecDeque<Packet>,
}

fn open(
    codec: ffmpeg_next::Codec,
    input: &StreamDescriptor,
    options: &EncoderOptions,
) -> std::result::Result<OpenedEncoder, ffmpeg_next::Error> {
    let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
    let mut encoder = ctx.encoder().video()?;
    encoder.set_width(input.width);
    encoder.set_height(input.height);
    encoder.set_format(pixel(input.pixel_format));
    encoder.set_time_base(ffmpeg_next::Rational::new(1, 1_000_000));
    encoder.set_frame_rate(Some(ffmpeg_next::Rational::new(options.framerate as i32, 1)));
    encoder.set_gop(options.gop_size);
    encoder.set_max_b_frames(0);
    if options.bitrate > 0 {
        encoder.set_bit_rate(options.bitrate as usize);
    }

    let mut opts = Dictionary::new();
    for (key, value) in &options.properties {
        opts.set(key, value);
    }
    if codec.name().starts_with("libx26") {
        if opts.get("preset").is_none() {
            opts.set("preset", "ultrafast");
        }
        if opts.get("tune").is_none() {
            opts.set("tune", "zerolatency");
        }
    }
    if let Some(profile_level) = &options.profile_level {
        opts.set("profile", &profile_level.profile);
        if let Some(level) = &profile_level.level {
            opts.set("level", level);
        }
    }
    if options.low_power && is_hardware_encoder(codec.name()) {
        opts.set("low_power", "1");
    }
    encoder.open_with(opts)
}

impl AvEncoder {
    pub fn new(input: &StreamDescriptor, options: &EncoderOptions) -> Result<Self> {
        let software = software_encoder(options.codec);
        let (encoder, name) = match find_hw_encoder(options.codec, options.plugin) {
            Some(hw) => match open(hw, input, options) {
                Ok(encoder) => (encoder, hw.name().to_string()),
                Err(e) => {
                    log::warn!(
                        "hardware encoder {} failed: {}, falling back to {}",
                        hw.name(),
                        e,
                        software
                    );
                    Self::open_software(&software, input, options)?
                }
            },
            None => Self::open_software(&software, input, options)?,
        };
        log::info!("encoder opened successfully: {}", name);
        Ok(Self {
            descriptor: StreamDescriptor::for_encoder_output(input, options.codec),
            hardware: is_hardware_encoder(&name),
            encoder,
            name,
            framerate: options.framerate,
            frame_index: 0,
            packets: VecDeque::new(),
        })
    }

    fn open_software(
        name: &str,
        input: &StreamDescriptor,
        options: &EncoderOptions,
    ) -> Result<(OpenedEncoder, String)> {
        let codec = ffmpeg_next::encoder::find_by_name(name)
            .ok_or_else(|| TranscodeError::Transient(format!("codec not found: {}", name)))?;
        let encoder = open(codec, input, options).map_err(|e| av_error(e, false, "open encoder"))?;
        Ok((encoder, name.to_string()))
    }

    fn set_option(&mut self, key: &str, value: i64) {
        let Ok(key_c) = CString::new(key) else {
            return;
        };
        let ret = unsafe {
            ffi::av_opt_set_int(
                self.encoder.as_mut_ptr() as *mut c_void,
                key_c.as_ptr(),
                value,
                ffi::AV_OPT_SEARCH_CHILDREN as i32,
            )
        };
        if ret < 0 {
            log::debug!("{} ignores option {}={}", self.name, key, value);
        }
    }

    fn attach_roi(frame: &mut ffmpeg_next::frame::Video, regions: &[Roi]) {
        let item = std::mem::size_of::<ffi::AVRegionOfInterest>();
        unsafe {
            let side = ffi::av_frame_new_side_data(
                frame.as_mut_ptr(),
                ffi::AVFrameSideDataType::AV_FRAME_DATA_REGIONS_OF_INTEREST,
                item * regions.len(),
            );
            if side.is_null() {
                return;
            }
            let out = (*side).data as *mut ffi::AVRegionOfInterest;
            for (i, roi) in regions.iter().enumerate() {
                out.add(i).write(ffi::AVRegionOfInterest {
                    self_size: item as u32,
                    top: roi.y,
                    bottom: roi.y + roi.height,
                    left: roi.x,
                    right: roi.x + roi.width,
                    qoffset: ffi::AVRational {
                        num: roi.qp_offset,
                        den: MAX_QP as i32,
                    },
                });
            }
        }
    }

    fn attach_user_data(frame: &mut ffmpeg_next::frame::Video, payload: &Bytes) {
        unsafe {
            let side = ffi::av_frame_new_side_data(
                frame.as_mut_ptr(),
                ffi::AVFrameSideDataType::AV_FRAME_DATA_SEI_UNREGISTERED,
                USER_DATA_UUID.len() + payload.len(),
            );
            if side.is_null() {
                return;
            }
            let out = std::slice::from_raw_parts_mut((*side).data, (*side).size);
            out[..USER_DATA_UUID.len()].copy_from_slice(&USER_DATA_UUID);
            out[USER_DATA_UUID.len()..].copy_from_slice(payload);
        }
    }

    fn apply(&mut self, directives: &[Directive], frame: &mut ffmpeg_next::frame::Video) {
        for directive in directives {
            match directive {
                Directive::ForceKeyFrame => frame.set_kind(picture::Type::I),
                Directive::Qp(qp) => self.set_option("qp", *qp as i64),
                Directive::RateControl(rc) => {
                    unsafe { (*self.encoder.as_mut_ptr()).bit_rate = rc.bitrate as i64 };
                    if rc.max_qp > 0 {
                        self.set_option("qmin", rc.min_qp as i64);
                        self.set_option("qmax", rc.max_qp as i64);
                    }
                }
                Directive::MaxBitrate(max) => unsafe {
                    (*self.encoder.as_mut_ptr()).rc_max_rate = *max as i64;
                },
                Directive::Framerate(fps) => {
                    self.framerate = *fps;
                    unsafe {
                        (*self.encoder.as_mut_ptr()).framerate = ffi::AVRational {
                            num: *fps as i32,
                            den: 1,
                        };
                    }
                }
                Directive::MaxFrameSize(size) => self.set_option("rc_buffer_size", *size as i64 * 8),
                Directive::IntraRefresh(_) => self.set_option("intra-refresh", 1),
                Directive::RegionsOfInterest(regions) => Self::attach_roi(frame, regions),
                Directive::MinMaxQp { min_qp, max_qp } => {
                    self.set_option("qmin", *min_qp as i64);
                    self.set_option("qmax", *max_qp as i64);
                }
                Directive::UserData(payload) => Self::attach_user_data(frame, payload),
                Directive::GopSize(gop) => {
                    unsafe { (*self.encoder.as_mut_ptr()).gop_size = *gop as i32 };
                    frame.set_kind(picture::Type::I);
                }
                Directive::Sei(_) | Directive::SkipFrames(_) => {
                    log::trace!("{} has no mapping for {}", self.name, directive.name());
                }
            }
        }
    }
}

impl EncoderStage for AvEncoder {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn write(&mut self, frame: Option<VideoFrame>) -> Result<()> {
        let Some(mut frame) = frame else {
            self.encoder
                .send_eof()
                .map_err(|e| av_error(e, self.hardware, "encoder eof"))?;
            return self.drain();
        };
        let directives = std::mem::take(&mut frame.side_data);
        let mut av = to_av(&frame)?;
        if av.pts().is_none() {
            av.set_pts(Some(self.frame_index as i64));
        }
        self.apply(&directives, &mut av);
        self.encoder
            .send_frame(&av)
            .map_err(|e| av_error(e, self.hardware, "send frame"))?;
        self.frame_index += 1;
        self.drain()
    }

    fn read(&mut self) -> Result<Option<Packet>> {
        Ok(self.packets.pop_front())
    }

    fn encoded_frames(&self) -> u64 {
        self.frame_index
    }
}

impl AvEncoder {
    fn drain(&mut self) -> Result<()> {
        loop {
            let mut av = ffmpeg_next::Packet::empty();
            match self.encoder.receive_packet(&mut av) {
                Ok(()) => {
                    let data = Bytes::copy_from_slice(av.data().unwrap_or_default());
                    let mut packet = Packet::new(Payload::Data(data), self.descriptor.index, Rational::MICROS);
                    packet.set_timestamps(av.pts(), av.dts());
                    packet.set_key(av.is_key());
                    if self.framerate > 0 {
                        packet.set_duration(1_000_000 / self.framerate as i64);
                    }
                    self.packets.push_back(packet);
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    return Ok(());
                }
                Err(err) => return Err(av_error(err, self.hardware, "receive packet")),
            }
        }
    }
}
