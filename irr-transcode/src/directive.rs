//! Side-channel directives carried alongside a frame to the encoder.
//!
//! Each pending parameter change becomes one [`Directive`]. Directives for a
//! frame are applied in the order of [`Directive::order`]:
//!
//! 1. force key frame
//! 2. constant QP
//! 3. bitrate rate control
//! 4. max bitrate
//! 5. framerate
//! 6. max frame size
//! 7. rolling intra refresh
//! 8. regions of interest
//! 9. min/max QP
//! 10. display-control user data
//! 11. SEI
//! 12. GOP size
//! 13. skipped frame count

use bytes::Bytes;

/// SEI type bits accepted by `set_sei`.
pub const SEI_FRAME_TIMING: u32 = 0x02;
pub const SEI_USER_DATA_UNREGISTERED: u32 = 0x08;

pub const MAX_ROI_REGIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    pub bitrate: u64,
    /// Zero leaves the encoder's QP bounds untouched.
    pub min_qp: u32,
    pub max_qp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntraRefreshKind {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraRefresh {
    pub kind: IntraRefreshKind,
    pub cycle_size: u32,
    pub qp_delta: i32,
}

/// A region-of-interest rectangle with a QP offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub qp_offset: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeiRequest {
    pub sei_type: u32,
    pub user_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    ForceKeyFrame,
    Qp(u32),
    RateControl(RateControl),
    MaxBitrate(u64),
    Framerate(u32),
    MaxFrameSize(u32),
    IntraRefresh(IntraRefresh),
    RegionsOfInterest(Vec<Roi>),
    MinMaxQp { min_qp: u32, max_qp: u32 },
    UserData(Bytes),
    Sei(SeiRequest),
    GopSize(u32),
    SkipFrames(u32),
}

impl Directive {
    pub fn order(&self) -> u8 {
        match self {
            Directive::ForceKeyFrame => 0,
            Directive::Qp(_) => 1,
            Directive::RateControl(_) => 2,
            Directive::MaxBitrate(_) => 3,
            Directive::Framerate(_) => 4,
            Directive::MaxFrameSize(_) => 5,
            Directive::IntraRefresh(_) => 6,
            Directive::RegionsOfInterest(_) => 7,
            Directive::MinMaxQp { .. } => 8,
            Directive::UserData(_) => 9,
            Directive::Sei(_) => 10,
            Directive::GopSize(_) => 11,
            Directive::SkipFrames(_) => 12,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Directive::ForceKeyFrame => "force_key_frame",
            Directive::Qp(_) => "qp",
            Directive::RateControl(_) => "bitrate",
            Directive::MaxBitrate(_) => "max_bitrate",
            Directive::Framerate(_) => "framerate",
            Directive::MaxFrameSize(_) => "max_frame_size",
            Directive::IntraRefresh(_) => "rolling_intra_refresh",
            Directive::RegionsOfInterest(_) => "roi",
            Directive::MinMaxQp { .. } => "min_max_qp",
            Directive::UserData(_) => "user_data",
            Directive::Sei(_) => "sei",
            Directive::GopSize(_) => "gop_size",
            Directive::SkipFrames(_) => "skip_frames",
        }
    }

    /// Directives that make the next encoded picture an IDR.
    pub fn requests_key_frame(&self) -> bool {
        matches!(self, Directive::ForceKeyFrame | Directive::GopSize(_))
    }
}

/// Sorts `directives` into application order, keeping the relative order of
/// equal kinds.
pub fn sort_directives(directives: &mut [Directive]) {
    directives.sort_by_key(Directive::order);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_sort_into_application_order() {
        let mut list = vec![
            Directive::SkipFrames(2),
            Directive::GopSize(60),
            Directive::Qp(30),
            Directive::UserData(Bytes::from_static(b"ctrl")),
            Directive::ForceKeyFrame,
        ];
        sort_directives(&mut list);
        let names: Vec<_> = list.iter().map(Directive::name).collect();
        assert_eq!(
            names,
            vec!["force_key_frame", "qp", "user_data", "gop_size", "skip_frames"]
        );
    }

    #[test]
    fn gop_change_requests_key_frame() {
        assert!(Directive::GopSize(30).requests_key_frame());
        assert!(!Directive::Qp(30).requests_key_frame());
    }
}
