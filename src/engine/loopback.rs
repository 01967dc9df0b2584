//! In-process engine for tests and the loopback demo mode.
//!
//! Implements the engine contract without any codec, container or socket
//! work: samples pushed into a source node are delivered, in order, to every
//! sink reachable from it in the graph. Delivery happens on a dedicated
//! worker thread, so sink callbacks observe the same threading model a real
//! engine gives them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::engine::bus::{BusEvent, TargetState};
use crate::engine::graph::{GraphSpec, LinkType, NodeKind};
use crate::engine::sample::Sample;
use crate::engine::{EnginePipeline, SampleHandler, StreamingEngine};
use crate::error::StreamError;

/// Engine factory for loopback pipelines.
pub struct LoopbackEngine;

impl StreamingEngine for LoopbackEngine {
    fn build(&self, spec: &GraphSpec) -> Result<Box<dyn EnginePipeline>, StreamError> {
        Ok(Box::new(LoopbackPipeline::new(spec)?))
    }
}

struct BusState {
    events: Mutex<VecDeque<BusEvent>>,
    available: Condvar,
}

struct Shared {
    /// source node → sinks its samples are delivered to
    routes: HashMap<String, Vec<String>>,
    sink_names: HashSet<String>,
    handlers: Mutex<HashMap<String, SampleHandler>>,
    bus: BusState,
    state: Mutex<TargetState>,
    job_tx: Mutex<Option<mpsc::Sender<(String, Sample)>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Shared {
    fn post(&self, event: BusEvent) {
        self.bus.events.lock().unwrap().push_back(event);
        self.bus.available.notify_all();
    }
}

/// One in-process pipeline instance. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LoopbackPipeline {
    shared: Arc<Shared>,
}

/// Pair each source with one same-type sink.
///
/// A source's elementary stream type is the type of its outgoing link.
/// Traversal follows every link except demux outputs of a different type.
/// When several same-type sinks are reachable (two video streams sharing one
/// demux), streams pair with sinks in declaration order, the way mpegts
/// assigns PIDs.
fn compute_routes(spec: &GraphSpec) -> HashMap<String, Vec<String>> {
    let mut routes = HashMap::new();
    let mut seen_per_type: HashMap<LinkType, usize> = HashMap::new();

    for source in spec.sources() {
        let Some(stream_type) = spec
            .links
            .iter()
            .find(|l| l.from == source.name)
            .map(|l| l.ty)
        else {
            continue;
        };

        // Typed reachability, keeping sink declaration order.
        let mut visited = HashSet::new();
        let mut stack = vec![source.name.clone()];
        let mut reached = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let kind = spec.node(&current).map(|n| n.kind);
            if kind == Some(NodeKind::Sink) {
                reached.insert(current);
                continue;
            }
            for link in spec.links.iter().filter(|l| l.from == current) {
                if kind == Some(NodeKind::Demux) && link.ty != stream_type {
                    continue;
                }
                stack.push(link.to.clone());
            }
        }
        let candidates: Vec<String> = spec
            .sinks()
            .filter(|n| reached.contains(&n.name))
            .map(|n| n.name.clone())
            .collect();

        let index = *seen_per_type
            .entry(stream_type)
            .and_modify(|i| *i += 1)
            .or_insert(0);
        if !candidates.is_empty() {
            routes.insert(
                source.name.clone(),
                vec![candidates[index % candidates.len()].clone()],
            );
        }
    }

    routes
}

impl LoopbackPipeline {
    pub fn new(spec: &GraphSpec) -> Result<Self, StreamError> {
        let routes = compute_routes(spec);
        let sink_names: HashSet<String> = spec.sinks().map(|n| n.name.clone()).collect();

        let (job_tx, job_rx) = mpsc::channel::<(String, Sample)>();

        let shared = Arc::new(Shared {
            routes,
            sink_names,
            handlers: Mutex::new(HashMap::new()),
            bus: BusState {
                events: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            },
            state: Mutex::new(TargetState::Ready),
            job_tx: Mutex::new(Some(job_tx)),
            worker: Mutex::new(None),
        });

        // Engine worker: delivers each job to the handlers of every sink
        // reachable from its source, preserving per-source FIFO order.
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("loopback-{}", spec.name))
            .spawn(move || {
                while let Ok((source, sample)) = job_rx.recv() {
                    let Some(sinks) = worker_shared.routes.get(&source) else {
                        continue;
                    };
                    let mut handlers = worker_shared.handlers.lock().unwrap();
                    for sink in sinks {
                        if let Some(handler) = handlers.get_mut(sink) {
                            handler(sample.clone());
                        }
                    }
                }
            })
            .map_err(|e| StreamError::Resource(format!("spawn loopback worker: {e}")))?;
        *shared.worker.lock().unwrap() = Some(handle);

        Ok(Self { shared })
    }

    /// Post a fabricated engine error onto the bus (fault injection).
    pub fn inject_error(&self, message: impl Into<String>) {
        self.shared.post(BusEvent::Error {
            message: message.into(),
        });
    }

    /// Post an end-of-stream notification onto the bus.
    pub fn signal_eos(&self) {
        self.shared.post(BusEvent::EndOfStream);
    }
}

impl EnginePipeline for LoopbackPipeline {
    fn set_state(&self, state: TargetState) -> Result<(), StreamError> {
        {
            let mut current = self.shared.state.lock().unwrap();
            if *current == TargetState::Stopped {
                // Stop is idempotent; everything else is refused once stopped.
                if state == TargetState::Stopped {
                    return Ok(());
                }
                return Err(StreamError::Pipeline(format!(
                    "cannot transition a stopped pipeline to {state}"
                )));
            }
            *current = state;
        }

        if state == TargetState::Stopped {
            // Close the job channel and wait for the worker so no callback is
            // in flight once this returns.
            self.shared.job_tx.lock().unwrap().take();
            if let Some(handle) = self.shared.worker.lock().unwrap().take()
                && handle.join().is_err()
            {
                warn!("loopback worker panicked during shutdown");
            }
            self.shared.handlers.lock().unwrap().clear();
        }

        self.shared.post(BusEvent::StateChanged { node: None, state });
        Ok(())
    }

    fn push_sample(&self, source: &str, sample: Sample) -> Result<(), StreamError> {
        if *self.shared.state.lock().unwrap() != TargetState::Playing {
            return Err(StreamError::Pipeline(format!(
                "push into '{source}' while not playing"
            )));
        }
        if !self.shared.routes.contains_key(source) {
            return Err(StreamError::Pipeline(format!("unknown source '{source}'")));
        }
        let guard = self.shared.job_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send((source.to_string(), sample))
                .map_err(|_| StreamError::Transport("loopback worker gone".into())),
            None => Err(StreamError::Transport("pipeline stopped".into())),
        }
    }

    fn connect_sink(&self, sink: &str, handler: SampleHandler) -> Result<(), StreamError> {
        if !self.shared.sink_names.contains(sink) {
            return Err(StreamError::Pipeline(format!("unknown sink '{sink}'")));
        }
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(sink.to_string(), handler);
        Ok(())
    }

    fn poll_event(&self, timeout: Duration) -> Option<BusEvent> {
        let mut events = self.shared.bus.events.lock().unwrap();
        if events.is_empty() {
            let (guard, _timed_out) = self
                .shared
                .bus
                .available
                .wait_timeout(events, timeout)
                .unwrap();
            events = guard;
        }
        events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::graph::{GraphBuilder, LinkType, NodeKind};
    use crate::engine::sample::PixelFormat;
    use crate::pipeline::types::Timestamp;

    fn two_sink_spec() -> GraphSpec {
        GraphBuilder::new("loop")
            .node("videosrc", NodeKind::Source)
            .node("klvsrc", NodeKind::Source)
            .node("mux", NodeKind::Mux)
            .node("demux", NodeKind::Demux)
            .node("video_sink", NodeKind::Sink)
            .node("klv_sink", NodeKind::Sink)
            .link("videosrc", "mux", LinkType::Video)
            .link("klvsrc", "mux", LinkType::Metadata)
            .link("mux", "demux", LinkType::Container)
            .link("demux", "video_sink", LinkType::Video)
            .link("demux", "klv_sink", LinkType::Metadata)
            .build()
            .unwrap()
    }

    fn frame_sample(seq: u64) -> Sample {
        Sample::video(
            vec![seq as u8; 3],
            1,
            1,
            PixelFormat::Rgb,
            Timestamp::from_micros(seq as i64),
            Some(seq),
        )
    }

    #[test]
    fn test_fifo_delivery_to_reachable_sinks() {
        let pipeline = LoopbackPipeline::new(&two_sink_spec()).unwrap();
        let (tx, rx) = mpsc::channel();
        pipeline
            .connect_sink(
                "video_sink",
                Box::new(move |s: Sample| {
                    tx.send(s.sequence.unwrap()).unwrap();
                }),
            )
            .unwrap();

        pipeline.set_state(TargetState::Playing).unwrap();
        for seq in 0..50u64 {
            pipeline.push_sample("videosrc", frame_sample(seq)).unwrap();
        }
        pipeline.set_state(TargetState::Stopped).unwrap();

        let received: Vec<u64> = rx.try_iter().collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_routing_respects_stream_type() {
        let routes = compute_routes(&two_sink_spec());
        assert_eq!(routes["videosrc"], vec!["video_sink"]);
        assert_eq!(routes["klvsrc"], vec!["klv_sink"]);
    }

    #[test]
    fn test_routing_pairs_streams_in_declaration_order() {
        let spec = GraphBuilder::new("two-stream")
            .node("videosrc1", NodeKind::Source)
            .node("videosrc2", NodeKind::Source)
            .node("mux", NodeKind::Mux)
            .node("demux", NodeKind::Demux)
            .node("video1_sink", NodeKind::Sink)
            .node("video2_sink", NodeKind::Sink)
            .link("videosrc1", "mux", LinkType::Video)
            .link("videosrc2", "mux", LinkType::Video)
            .link("mux", "demux", LinkType::Container)
            .link("demux", "video1_sink", LinkType::Video)
            .link("demux", "video2_sink", LinkType::Video)
            .build()
            .unwrap();

        let routes = compute_routes(&spec);
        assert_eq!(routes["videosrc1"], vec!["video1_sink"]);
        assert_eq!(routes["videosrc2"], vec!["video2_sink"]);
    }

    #[test]
    fn test_push_requires_playing() {
        let pipeline = LoopbackPipeline::new(&two_sink_spec()).unwrap();
        assert!(pipeline.push_sample("videosrc", frame_sample(0)).is_err());
    }

    #[test]
    fn test_stop_is_idempotent_and_terminal() {
        let pipeline = LoopbackPipeline::new(&two_sink_spec()).unwrap();
        pipeline.set_state(TargetState::Playing).unwrap();
        pipeline.set_state(TargetState::Stopped).unwrap();
        pipeline.set_state(TargetState::Stopped).unwrap();
        assert!(pipeline.set_state(TargetState::Playing).is_err());
        assert!(pipeline.push_sample("videosrc", frame_sample(0)).is_err());
    }

    #[test]
    fn test_bus_carries_injected_error() {
        let pipeline = LoopbackPipeline::new(&two_sink_spec()).unwrap();
        pipeline.inject_error("simulated transport failure");
        match pipeline.poll_event(Duration::from_millis(100)) {
            Some(BusEvent::Error { message }) => {
                assert_eq!(message, "simulated transport failure")
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_poll_event_times_out_empty() {
        let pipeline = LoopbackPipeline::new(&two_sink_spec()).unwrap();
        assert_eq!(pipeline.poll_event(Duration::from_millis(10)), None);
    }
}
