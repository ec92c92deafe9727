//! Pending encoder parameter changes staged by the control plane.
//!
//! Setters validate, stage a value and return immediately. The transcoder
//! drains live changes with [`ParameterChannel::take_directives`] right before
//! encoding a frame, and restart-class changes (resolution, codec,
//! profile/level) with [`ParameterChannel::take_restart`]. Staging the same
//! property twice before it is drained keeps the last value.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    directive::{
        Directive, IntraRefresh, MAX_ROI_REGIONS, RateControl, Roi, SEI_FRAME_TIMING,
        SEI_USER_DATA_UNREGISTERED, SeiRequest,
    },
    error::{Result, TranscodeError},
    frame::CropRect,
    stream::CodecId,
};

pub const MIN_QP: u32 = 1;
pub const MAX_QP: u32 = 51;
pub const MAX_RESOLUTION: u32 = 4096;
pub const MAX_FRAMERATE: u32 = 240;

const H264_PROFILES: &[&str] = &["high", "main", "constrained_baseline", "default"];
const HEVC_PROFILES: &[&str] = &["main", "main10", "rext", "default"];
const AV1_PROFILES: &[&str] = &["main", "high", "professional", "default"];
const H264_LEVELS: &[&str] = &[
    "1", "1.1", "1.2", "1.3", "2", "2.1", "2.2", "3", "3.1", "3.2", "4", "4.1", "4.2", "5", "5.1",
    "5.2", "6", "6.1", "6.2", "default",
];
const HEVC_LEVELS: &[&str] = &[
    "1", "2", "2.1", "3", "3.1", "4", "4.1", "5", "5.1", "5.2", "6", "6.1", "6.2", "default",
];
const AV1_LEVELS: &[&str] = &[
    "2", "2.1", "2.2", "2.3", "3", "3.1", "3.2", "3.3", "4", "4.1", "4.2", "4.3", "5", "5.1",
    "5.2", "5.3", "6", "6.1", "6.2", "6.3", "default",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLevel {
    pub profile: String,
    pub level: Option<String>,
}

/// Visible client area inside the rendered frame buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CropInfo {
    pub client_width: u32,
    pub client_height: u32,
    pub fb_width: u32,
    pub fb_height: u32,
    pub left: u32,
    pub top: u32,
}

impl CropInfo {
    fn orientation_matches(&self) -> bool {
        (self.client_height > self.client_width) == (self.fb_height > self.fb_width)
    }

    fn rect(&self) -> CropRect {
        CropRect {
            left: self.left,
            top: self.top,
            right: self.left.saturating_add(self.client_width),
            bottom: self.top.saturating_add(self.client_height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOrigin {
    Explicit,
    Crop,
}

/// Restart-class changes drained in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartRequest {
    pub resolution: Option<(u32, u32)>,
    pub codec: Option<CodecId>,
    pub profile_level: Option<ProfileLevel>,
}

impl RestartRequest {
    pub fn is_empty(&self) -> bool {
        self.resolution.is_none() && self.codec.is_none() && self.profile_level.is_none()
    }
}

/// Values the encoder currently runs with, as far as the channel knows.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u64,
    pub gop_size: u32,
}

#[derive(Debug, Default)]
struct Staged {
    force_key_frame: bool,
    qp: Option<u32>,
    rate_control: Option<RateControl>,
    max_bitrate: Option<u64>,
    framerate: Option<u32>,
    max_frame_size: Option<u32>,
    intra_refresh: Option<IntraRefresh>,
    roi: Option<Vec<Roi>>,
    min_max_qp: Option<(u32, u32)>,
    sei: Option<SeiRequest>,
    gop_size: Option<u32>,
    resolution: Option<(u32, u32, ResolutionOrigin)>,
    codec: Option<CodecId>,
    profile_level: Option<ProfileLevel>,
}

struct ChannelState {
    current: EncoderSettings,
    min_qp: u32,
    max_qp: u32,
    skip_frame: bool,
    crop: Option<CropInfo>,
    prev_client: (u32, u32),
    staged: Staged,
}

pub struct ParameterChannel {
    state: Mutex<ChannelState>,
}

fn reject(msg: String) -> TranscodeError {
    log::warn!("rejected parameter change: {}", msg);
    TranscodeError::InvalidArgument(msg)
}

impl ParameterChannel {
    pub fn new(current: EncoderSettings) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                current,
                min_qp: 0,
                max_qp: 0,
                skip_frame: false,
                crop: None,
                prev_client: (0, 0),
                staged: Staged::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> EncoderSettings {
        self.lock().current.clone()
    }

    pub fn force_key_frame(&self) -> Result<()> {
        self.lock().staged.force_key_frame = true;
        log::info!("key frame requested");
        Ok(())
    }

    pub fn set_qp(&self, qp: u32) -> Result<()> {
        if !(MIN_QP..=MAX_QP).contains(&qp) {
            return Err(reject(format!("qp {} outside [{}, {}]", qp, MIN_QP, MAX_QP)));
        }
        self.lock().staged.qp = Some(qp);
        log::info!("qp set to {}", qp);
        Ok(())
    }

    pub fn set_bitrate(&self, bitrate: u64) -> Result<()> {
        if bitrate == 0 {
            return Err(reject("bitrate must be positive".to_string()));
        }
        let mut state = self.lock();
        state.current.bitrate = bitrate;
        state.staged.rate_control = Some(RateControl {
            bitrate,
            min_qp: state.min_qp,
            max_qp: state.max_qp,
        });
        log::info!("bitrate set to {}", bitrate);
        Ok(())
    }

    pub fn set_max_bitrate(&self, max_bitrate: u64) -> Result<()> {
        if max_bitrate == 0 {
            return Err(reject("max bitrate must be positive".to_string()));
        }
        self.lock().staged.max_bitrate = Some(max_bitrate);
        log::info!("max bitrate set to {}", max_bitrate);
        Ok(())
    }

    pub fn set_framerate(&self, framerate: u32) -> Result<()> {
        if framerate == 0 || framerate > MAX_FRAMERATE {
            return Err(reject(format!(
                "framerate {} outside [1, {}]",
                framerate, MAX_FRAMERATE
            )));
        }
        let mut state = self.lock();
        state.current.framerate = framerate;
        state.staged.framerate = Some(framerate);
        log::info!("framerate set to {}", framerate);
        Ok(())
    }

    pub fn set_max_frame_size(&self, size: u32) -> Result<()> {
        if size == 0 {
            return Err(reject("max frame size must be positive".to_string()));
        }
        self.lock().staged.max_frame_size = Some(size);
        log::info!("max frame size set to {}", size);
        Ok(())
    }

    pub fn set_rolling_intra_refresh(&self, refresh: IntraRefresh) -> Result<()> {
        if refresh.cycle_size == 0 {
            return Err(reject("intra refresh cycle must be positive".to_string()));
        }
        if refresh.qp_delta.unsigned_abs() > MAX_QP {
            return Err(reject(format!(
                "intra refresh qp delta {} outside [-51, 51]",
                refresh.qp_delta
            )));
        }
        self.lock().staged.intra_refresh = Some(refresh);
        log::info!("rolling intra refresh set to {:?}", refresh);
        Ok(())
    }

    /// Stages regions of interest. An empty list clears them.
    pub fn set_region_of_interest(&self, regions: Vec<Roi>) -> Result<()> {
        if regions.len() > MAX_ROI_REGIONS {
            return Err(reject(format!(
                "{} regions of interest, at most {}",
                regions.len(),
                MAX_ROI_REGIONS
            )));
        }
        let mut state = self.lock();
        let (width, height) = (state.current.width as i64, state.current.height as i64);
        for roi in &regions {
            let inside = roi.x >= 0
                && roi.y >= 0
                && roi.width > 0
                && roi.height > 0
                && roi.x as i64 + roi.width as i64 <= width
                && roi.y as i64 + roi.height as i64 <= height;
            if !inside {
                drop(state);
                return Err(reject(format!(
                    "region {:?} outside {}x{} frame",
                    roi, width, height
                )));
            }
            if roi.qp_offset.unsigned_abs() > MAX_QP {
                drop(state);
                return Err(reject(format!(
                    "region qp offset {} outside [-51, 51]",
                    roi.qp_offset
                )));
            }
        }
        log::info!("{} regions of interest staged", regions.len());
        state.staged.roi = Some(regions);
        Ok(())
    }

    pub fn set_min_max_qp(&self, min_qp: u32, max_qp: u32) -> Result<()> {
        if !(MIN_QP <= min_qp && min_qp <= max_qp && max_qp <= MAX_QP) {
            return Err(reject(format!("qp range [{}, {}] invalid", min_qp, max_qp)));
        }
        let mut state = self.lock();
        if state.current.bitrate == 0 {
            drop(state);
            return Err(reject("qp range needs a bitrate rate control".to_string()));
        }
        state.min_qp = min_qp;
        state.max_qp = max_qp;
        state.staged.min_max_qp = Some((min_qp, max_qp));
        log::info!("qp range set to [{}, {}]", min_qp, max_qp);
        Ok(())
    }

    /// Stages an explicit resolution change. It takes precedence over any
    /// crop-derived resolution pending in the same cycle.
    pub fn change_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut state = self.lock();
        let codec = state.staged.codec.unwrap_or(state.current.codec);
        let min = codec.min_dimension();
        let valid = |v: u32| (min..=MAX_RESOLUTION).contains(&v);
        if !valid(width) || !valid(height) {
            drop(state);
            return Err(reject(format!(
                "resolution {}x{} outside [{}, {}] for {}",
                width,
                height,
                min,
                MAX_RESOLUTION,
                codec.name()
            )));
        }
        state.staged.resolution = Some((width, height, ResolutionOrigin::Explicit));
        log::info!("resolution change to {}x{} staged", width, height);
        Ok(())
    }

    /// Stages a codec switch. Only H.264 and HEVC are accepted; switching to
    /// the codec already in effect does nothing.
    pub fn change_codec(&self, codec: CodecId) -> Result<()> {
        if !matches!(codec, CodecId::H264 | CodecId::Hevc) {
            return Err(reject(format!("codec {} not switchable", codec.name())));
        }
        let mut state = self.lock();
        let effective = state.staged.codec.unwrap_or(state.current.codec);
        if effective == codec {
            return Ok(());
        }
        state.staged.codec = Some(codec);
        state.staged.profile_level = None;
        log::info!("codec change to {} staged", codec.name());
        Ok(())
    }

    pub fn change_profile_level(&self, profile: &str, level: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        let codec = state.staged.codec.unwrap_or(state.current.codec);
        let (profiles, levels) = match codec {
            CodecId::H264 => (H264_PROFILES, H264_LEVELS),
            CodecId::Hevc => (HEVC_PROFILES, HEVC_LEVELS),
            CodecId::Av1 => (AV1_PROFILES, AV1_LEVELS),
            other => {
                drop(state);
                return Err(reject(format!("no profiles for {}", other.name())));
            }
        };
        if !profiles.contains(&profile) {
            drop(state);
            return Err(reject(format!("unknown {} profile {}", codec.name(), profile)));
        }
        if let Some(level) = level {
            if !levels.contains(&level) {
                drop(state);
                return Err(reject(format!("unknown {} level {}", codec.name(), level)));
            }
        }
        state.staged.profile_level = Some(ProfileLevel {
            profile: profile.to_string(),
            level: level.map(str::to_string),
        });
        log::info!("profile {} level {:?} staged", profile, level);
        Ok(())
    }

    /// Stages a GOP size. Re-setting the current size succeeds without
    /// staging anything.
    pub fn set_gop_size(&self, gop_size: u32) -> Result<()> {
        if gop_size < 1 {
            return Err(reject(format!("gop size {} below 1", gop_size)));
        }
        let mut state = self.lock();
        if state.current.gop_size == gop_size {
            return Ok(());
        }
        state.current.gop_size = gop_size;
        state.staged.gop_size = Some(gop_size);
        log::info!("gop size set to {}", gop_size);
        Ok(())
    }

    pub fn set_sei(&self, sei_type: u32, user_id: u32) -> Result<()> {
        if sei_type & (SEI_FRAME_TIMING | SEI_USER_DATA_UNREGISTERED) == 0 {
            return Err(reject(format!("sei type {:#x} not supported", sei_type)));
        }
        self.lock().staged.sei = Some(SeiRequest { sei_type, user_id });
        log::info!("sei type {:#x} staged", sei_type);
        Ok(())
    }

    pub fn set_skip_frame_flag(&self, enabled: bool) -> Result<()> {
        self.lock().skip_frame = enabled;
        log::info!("skip frame reporting {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    pub fn skip_frame_enabled(&self) -> bool {
        self.lock().skip_frame
    }

    pub fn set_crop(&self, crop: CropInfo) -> Result<()> {
        let fits = crop.client_width > 0
            && crop.client_height > 0
            && crop
                .left
                .checked_add(crop.client_width)
                .is_some_and(|right| right <= crop.fb_width)
            && crop
                .top
                .checked_add(crop.client_height)
                .is_some_and(|bottom| bottom <= crop.fb_height);
        if !fits {
            return Err(reject(format!("crop {:?} outside frame buffer", crop)));
        }
        self.lock().crop = Some(crop);
        log::info!(
            "crop set to {}x{} at ({}, {}) in {}x{}",
            crop.client_width,
            crop.client_height,
            crop.left,
            crop.top,
            crop.fb_width,
            crop.fb_height
        );
        Ok(())
    }

    pub fn clear_crop(&self) {
        self.lock().crop = None;
    }

    /// Reads the staged crop for one processed frame.
    ///
    /// When the client area changed since the last observed crop and its
    /// orientation matches the frame buffer, a crop-derived resolution change
    /// is staged unless an explicit one is already pending.
    pub fn crop_for_frame(&self) -> Option<CropRect> {
        let mut state = self.lock();
        let crop = state.crop?;
        if !crop.orientation_matches() {
            return None;
        }
        let (prev_w, prev_h) = state.prev_client;
        let width_changed = crop.client_width != crop.fb_width && prev_w != crop.client_width;
        let height_changed = crop.client_height != crop.fb_height && prev_h != crop.client_height;
        if width_changed || height_changed {
            state.prev_client = (crop.client_width, crop.client_height);
            let codec = state.staged.codec.unwrap_or(state.current.codec);
            let range = codec.min_dimension()..=MAX_RESOLUTION;
            let explicit_pending = matches!(
                state.staged.resolution,
                Some((_, _, ResolutionOrigin::Explicit))
            );
            if !range.contains(&crop.client_width) || !range.contains(&crop.client_height) {
                log::warn!(
                    "crop client area {}x{} outside encoder limits",
                    crop.client_width,
                    crop.client_height
                );
            } else if !explicit_pending {
                state.staged.resolution = Some((
                    crop.client_width,
                    crop.client_height,
                    ResolutionOrigin::Crop,
                ));
                log::info!(
                    "crop resize to {}x{} staged",
                    crop.client_width,
                    crop.client_height
                );
            }
        }
        Some(crop.rect())
    }

    /// Drains live parameter changes in application order.
    pub fn take_directives(&self) -> Vec<Directive> {
        let mut state = self.lock();
        let staged = &mut state.staged;
        let mut out = Vec::new();
        if std::mem::take(&mut staged.force_key_frame) {
            out.push(Directive::ForceKeyFrame);
        }
        if let Some(qp) = staged.qp.take() {
            out.push(Directive::Qp(qp));
        }
        if let Some(rc) = staged.rate_control.take() {
            out.push(Directive::RateControl(rc));
        }
        if let Some(max) = staged.max_bitrate.take() {
            out.push(Directive::MaxBitrate(max));
        }
        if let Some(fps) = staged.framerate.take() {
            out.push(Directive::Framerate(fps));
        }
        if let Some(size) = staged.max_frame_size.take() {
            out.push(Directive::MaxFrameSize(size));
        }
        if let Some(refresh) = staged.intra_refresh.take() {
            out.push(Directive::IntraRefresh(refresh));
        }
        if let Some(roi) = staged.roi.take() {
            out.push(Directive::RegionsOfInterest(roi));
        }
        if let Some((min_qp, max_qp)) = staged.min_max_qp.take() {
            out.push(Directive::MinMaxQp { min_qp, max_qp });
        }
        if let Some(sei) = staged.sei.take() {
            out.push(Directive::Sei(sei));
        }
        if let Some(gop) = staged.gop_size.take() {
            out.push(Directive::GopSize(gop));
        }
        out
    }

    /// Puts back directives the encoder never accepted. A slot that was
    /// written again in the meantime keeps the newer value.
    pub fn restage(&self, directives: Vec<Directive>) {
        let mut state = self.lock();
        let staged = &mut state.staged;
        for directive in directives {
            match directive {
                Directive::ForceKeyFrame => staged.force_key_frame = true,
                Directive::Qp(qp) => {
                    staged.qp.get_or_insert(qp);
                }
                Directive::RateControl(rc) => {
                    staged.rate_control.get_or_insert(rc);
                }
                Directive::MaxBitrate(max) => {
                    staged.max_bitrate.get_or_insert(max);
                }
                Directive::Framerate(fps) => {
                    staged.framerate.get_or_insert(fps);
                }
                Directive::MaxFrameSize(size) => {
                    staged.max_frame_size.get_or_insert(size);
                }
                Directive::IntraRefresh(refresh) => {
                    staged.intra_refresh.get_or_insert(refresh);
                }
                Directive::RegionsOfInterest(roi) => {
                    staged.roi.get_or_insert(roi);
                }
                Directive::MinMaxQp { min_qp, max_qp } => {
                    staged.min_max_qp.get_or_insert((min_qp, max_qp));
                }
                Directive::Sei(sei) => {
                    staged.sei.get_or_insert(sei);
                }
                Directive::GopSize(gop) => {
                    staged.gop_size.get_or_insert(gop);
                }
                Directive::UserData(_) | Directive::SkipFrames(_) => {}
            }
        }
    }

    /// True when a restart-class change is waiting.
    pub fn restart_pending(&self) -> bool {
        let state = self.lock();
        state.staged.resolution.is_some()
            || state.staged.codec.is_some()
            || state.staged.profile_level.is_some()
    }

    /// Drains restart-class changes and records them as current.
    pub fn take_restart(&self) -> RestartRequest {
        let mut state = self.lock();
        let request = RestartRequest {
            resolution: state.staged.resolution.take().map(|(w, h, _)| (w, h)),
            codec: state.staged.codec.take(),
            profile_level: state.staged.profile_level.take(),
        };
        if let Some((width, height)) = request.resolution {
            state.current.width = width;
            state.current.height = height;
        }
        if let Some(codec) = request.codec {
            state.current.codec = codec;
        }
        request
    }
}

#[cfg(test)]
#[path = "params_test.rs"]
mod params_test;
