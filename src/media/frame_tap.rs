use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::media::pipeline::PipelineHandle;

/// One RGB frame pulled off `zsad_sink`, handed to the inference dispatcher.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: i32,
    pub height: i32,
    pub rgb: Vec<u8>,
}

/// Wires `zsad_sink`'s `new-sample` signal to a capacity-1 channel. The
/// appsink itself already holds `max-buffers=1 drop=true`, so this is belt
/// and suspenders against a dispatcher that is mid-inference when new
/// samples land.
pub fn install(pipeline: &PipelineHandle, width: i32, height: i32) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel::<Frame>(1);

    let Some(appsink_elem) = pipeline.by_name("zsad_sink") else {
        warn!("zsad_sink not present, frame tap disabled");
        return rx;
    };
    let appsink = appsink_elem
        .dynamic_cast::<gst_app::AppSink>()
        .expect("zsad_sink is not an appsink");

    let tx = Arc::new(tx);
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = Frame {
                    width,
                    height,
                    rgb: map.as_slice().to_vec(),
                };

                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
                    debug!("frame tap channel full, dropping sample");
                }

                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    rx
}
