//! One streaming session: a [`FrameSource`] feeding a [`Transcoder`].

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    backend::{CodecBackend, Demux},
    config::TranscoderConfig,
    error::Result,
    sink::OutputSink,
    source::{FrameSource, IngressFrame},
    transcoder::{FatalHandler, RunPredicate, Transcoder},
};

pub struct Session {
    config: TranscoderConfig,
    source: Arc<FrameSource>,
    transcoder: Transcoder,
}

impl Session {
    pub fn new(
        config: TranscoderConfig,
        backend: Box<dyn CodecBackend>,
        sink: Box<dyn OutputSink>,
    ) -> Result<Self> {
        let source = Arc::new(FrameSource::new());
        let demux: Arc<dyn Demux> = Arc::clone(&source) as Arc<dyn Demux>;
        let transcoder = Transcoder::new(config.clone(), demux, backend, sink)?;
        Ok(Self {
            config,
            source,
            transcoder,
        })
    }

    pub fn with_run_predicate(mut self, allow_run: RunPredicate) -> Self {
        self.transcoder = self.transcoder.with_run_predicate(allow_run);
        self
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.transcoder = self.transcoder.with_fatal_handler(fatal);
        self
    }

    /// Starts the frame source, then the transcoder worker. A failed worker
    /// start leaves the source stopped again.
    pub fn start(&self) -> Result<()> {
        self.source.start(self.config.source_params())?;
        if let Err(e) = self.transcoder.start() {
            self.source.stop();
            return Err(e);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.transcoder.stop();
        self.source.stop();
    }

    pub fn is_running(&self) -> bool {
        self.source.is_running()
    }

    /// Hands a rendered frame to the source; never blocks on the encoder.
    pub fn push_frame(&self, frame: IngressFrame<'_>, user_data: Option<Bytes>) -> Result<()> {
        self.source.push(frame, user_data)
    }

    pub fn send_message(&self, message: &[u8]) -> Result<()> {
        self.transcoder.send_message(message)
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn transcoder(&self) -> &Transcoder {
        &self.transcoder
    }
}
