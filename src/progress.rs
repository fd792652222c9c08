/////////////////////////////////////////////////////////////////////////////////////////////
//
// Defines progress and diagnostic messages, sinks, and helpers for long-running encodes.
//
// Created on: 09 Feb 2026     Author: Daniel Owen
//
// Copyright (c) 2025, Maptek Pty Ltd. All rights reserved. Licensed under the MIT License.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! Progress reporting and numerical-diagnostic primitives.
//!
//! Encoding and adaptive refinement are long-running; this channel carries
//! their progress as well as the numerical warnings that are absorbed locally
//! with a documented fallback (unit weights, unscaled points) rather than
//! raised as errors.

use std::fmt::Debug;
use std::sync::{mpsc, Arc};
use std::thread;

/// Progress events and numerical diagnostics emitted during encoding,
/// decoding, and adaptive refinement.
#[derive(Debug, Clone)]
pub enum ProgressMsg {
    /// One dimension of the separable encode finished.
    EncodeDimension { dim: usize, ncurves: usize },

    /// One adaptive refinement round finished.
    RefinementRound {
        round: usize,
        new_knots: usize,
        max_err: f64,
    },

    /// A rational denominator of zero was met while decoding; the point was
    /// left unscaled.
    ZeroDenominator { param: Vec<f64> },

    /// The weight solver found non-positive or repeated eigenvalues and fell
    /// back to unit weights.
    DegenerateEigenvalues { curve: usize },

    /// The weight solver found positive weights by expanding the eigenspace.
    WeightsFromEigenspace {
        curve: usize,
        num_eigenvectors: usize,
    },

    /// The weight solver could not find positive weights; unit weights used.
    WeightFallback { curve: usize },

    /// More control points than input points were requested in a dimension;
    /// compression is impossible there.
    CompressionImpossible {
        dim: usize,
        nctrl_pts: usize,
        ndom_pts: usize,
    },

    /// Arbitrary informational message.
    Message { message: String },
}

/// Sink that consumes progress messages.
pub trait ProgressSink: Send + Sync + Debug {
    fn emit(&self, msg: ProgressMsg);
}

/// Progress sink that forwards messages over a channel.
#[derive(Debug)]
pub struct ClosureSink {
    tx: mpsc::SyncSender<ProgressMsg>,
}

impl ProgressSink for ClosureSink {
    #[inline]
    fn emit(&self, msg: ProgressMsg) {
        let _ = self.tx.try_send(msg);
    }
}

/// Spawns a listener thread that runs a handler closure for each progress message.
pub fn closure_sink<F>(
    buffer: usize,
    mut handler: F,
) -> (Arc<dyn ProgressSink>, thread::JoinHandle<()>)
where
    F: FnMut(ProgressMsg) + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<ProgressMsg>(buffer.max(1));
    let sink: Arc<dyn ProgressSink> = Arc::new(ClosureSink { tx });

    let handle = thread::spawn(move || {
        while let Ok(msg) = rx.recv() {
            handler(msg);
        }
    });

    (sink, handle)
}

/// Emit on an optional sink without the caller repeating the `if let` dance.
#[inline]
pub(crate) fn emit(sink: &Option<Arc<dyn ProgressSink>>, msg: ProgressMsg) {
    if let Some(sink) = sink {
        sink.emit(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closure_sink_delivers_messages() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);

        let (sink, handle) = closure_sink(16, |_msg| {
            COUNT.fetch_add(1, Ordering::SeqCst);
        });

        sink.emit(ProgressMsg::Message {
            message: "one".into(),
        });
        sink.emit(ProgressMsg::RefinementRound {
            round: 0,
            new_knots: 3,
            max_err: 0.5,
        });

        drop(sink);
        handle.join().unwrap();

        assert_eq!(COUNT.load(Ordering::SeqCst), 2);
    }
}
