use bytes::Bytes;

use crate::{directive::Directive, frame::SurfaceId, stream::Rational};

#[derive(Debug, Clone)]
pub enum Payload {
    Data(Bytes),
    Surface(SurfaceId),
}

/// One unit of compressed or raw data moving between stages. Ownership moves
/// with the value; no stage keeps a reference after handing it on.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Payload,
    stream_index: usize,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    time_base: Rational,
    key: bool,
    corrupt: bool,
    side_data: Vec<Directive>,
}

impl Packet {
    pub fn new(payload: Payload, stream_index: usize, time_base: Rational) -> Self {
        Self {
            payload,
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            time_base,
            key: false,
            corrupt: false,
            side_data: Vec::new(),
        }
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn set_timestamps(&mut self, pts: Option<i64>, dts: Option<i64>) {
        self.pts = pts;
        self.dts = dts;
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.duration = duration;
    }

    pub fn index(&self) -> usize {
        self.stream_index
    }

    pub fn set_index(&mut self, index: usize) {
        self.stream_index = index;
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Moves the timestamps into `to` units.
    pub fn rescale_ts(&mut self, to: Rational) {
        let from = self.time_base;
        self.pts = self.pts.map(|v| Rational::rescale(v, from, to));
        self.dts = self.dts.map(|v| Rational::rescale(v, from, to));
        self.duration = Rational::rescale(self.duration, from, to);
        self.time_base = to;
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn data(&self) -> Bytes {
        match &self.payload {
            Payload::Data(data) => data.clone(),
            Payload::Surface(_) => Bytes::new(),
        }
    }

    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Data(data) => data.len(),
            Payload::Surface(_) => 0,
        }
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn set_key(&mut self, key: bool) {
        self.key = key;
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    pub fn set_corrupt(&mut self, corrupt: bool) {
        self.corrupt = corrupt;
    }

    pub fn side_data(&self) -> &[Directive] {
        &self.side_data
    }

    pub fn push_side_data(&mut self, directive: Directive) {
        self.side_data.push(directive);
    }

    pub fn take_side_data(&mut self) -> Vec<Directive> {
        std::mem::take(&mut self.side_data)
    }
}
