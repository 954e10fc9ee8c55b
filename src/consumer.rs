use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{Error, Result};
use crate::processor::{self, LogSink, TelemetrySink};
use crate::stream::{EventStream, PartitionReader};

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub receive_timeout: Duration,
    pub max_batch: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            receive_timeout: Duration::from_millis(100),
            max_batch: 100,
        }
    }
}

/// Terminal state of every reader after `run` has joined them all.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub clean: Vec<String>,
    pub failed: Vec<String>,
}

/// Spawn one reader thread per distinct partition and block until all of
/// them have exited. Readers only exit on a fatal stream error or once the
/// stop flag is raised. A single dead reader costs that partition's
/// coverage but does not bring the process down; only all readers failing
/// (without a stop request) is reported as an error.
pub fn run<S>(
    stream: Arc<S>,
    partitions: &[String],
    options: ReaderOptions,
    stop: Arc<AtomicBool>,
) -> Result<RunSummary>
where
    S: EventStream + 'static,
{
    let mut seen: Vec<String> = Vec::new();
    let mut handles = Vec::new();

    for partition in partitions {
        if seen.contains(partition) {
            warn!("duplicate partition id {partition} in topology, ignoring");
            continue;
        }
        seen.push(partition.clone());

        let stream = Arc::clone(&stream);
        let stop = Arc::clone(&stop);
        let options = options.clone();
        let partition = partition.clone();
        let reader_partition = partition.clone();
        let handle = thread::Builder::new()
            .name(format!("partition-{partition}"))
            .spawn(move || -> Result<u64> {
                let mut reader = stream.open_reader(&reader_partition)?;
                info!("created receiver on partition {reader_partition}");
                read_partition(&reader_partition, &mut reader, &options, &stop, &mut LogSink)
            })
            .map_err(|e| Error::StreamRead {
                partition: partition.clone(),
                reason: format!("cannot spawn reader thread: {e}"),
            })?;
        handles.push((partition, handle));
    }

    let spawned = handles.len();
    let mut summary = RunSummary::default();
    for (partition, handle) in handles {
        match handle.join() {
            Ok(Ok(count)) => {
                info!("partition {partition} reader stopped after {count} events");
                summary.clean.push(partition);
            }
            Ok(Err(e)) => {
                error!("partition {partition} reader terminated: {e}");
                summary.failed.push(partition);
            }
            Err(_) => {
                error!("partition {partition} reader panicked");
                summary.failed.push(partition);
            }
        }
    }

    if !stop.load(Ordering::Relaxed) && spawned > 0 && summary.failed.len() == spawned {
        return Err(Error::AllReadersFailed(spawned));
    }
    Ok(summary)
}

/// One partition's receive loop. Every iteration waits up to the receive
/// timeout for a batch; an empty batch is a normal pass. Events are handed
/// to the processor in receipt order, undecodable ones are skipped. The
/// loop ends when the stop flag is raised (clean) or the stream fails
/// (terminal error). Returns the number of events processed.
pub(crate) fn read_partition<R: PartitionReader>(
    partition: &str,
    reader: &mut R,
    options: &ReaderOptions,
    stop: &AtomicBool,
    sink: &mut dyn TelemetrySink,
) -> Result<u64> {
    let mut processed = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let batch = reader.receive(options.max_batch, options.receive_timeout)?;
        for event in &batch {
            match processor::process(event) {
                Ok(telemetry) => {
                    sink.record(partition, telemetry);
                    processed += 1;
                }
                Err(e) => warn!("partition {partition}: skipping event: {e}"),
            }
        }
    }
    reader.close();
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use crate::processor::Telemetry;
    use crate::stream::TelemetryEvent;

    fn event(body: &str, properties: Value) -> TelemetryEvent {
        TelemetryEvent {
            payload: json!({"body": body, "properties": properties})
                .to_string()
                .into_bytes(),
        }
    }

    fn bad_event() -> TelemetryEvent {
        TelemetryEvent {
            payload: vec![0xff, 0xfe],
        }
    }

    enum Step {
        Batch(Vec<TelemetryEvent>),
        Empty,
        Fail,
    }

    /// Plays back a script of receive outcomes; raises the shared stop flag
    /// once the script runs out so loops terminate deterministically.
    struct ScriptedReader {
        partition: String,
        steps: VecDeque<Step>,
        stop: Arc<AtomicBool>,
        closed: bool,
    }

    impl ScriptedReader {
        fn new(partition: &str, steps: Vec<Step>, stop: Arc<AtomicBool>) -> ScriptedReader {
            ScriptedReader {
                partition: partition.to_string(),
                steps: steps.into(),
                stop,
                closed: false,
            }
        }
    }

    impl PartitionReader for ScriptedReader {
        fn receive(&mut self, _max: usize, _timeout: Duration) -> Result<Vec<TelemetryEvent>> {
            match self.steps.pop_front() {
                Some(Step::Batch(events)) => Ok(events),
                Some(Step::Empty) => Ok(Vec::new()),
                Some(Step::Fail) => Err(Error::StreamRead {
                    partition: self.partition.clone(),
                    reason: "stream closed".into(),
                }),
                None => {
                    self.stop.store(true, Ordering::Relaxed);
                    Ok(Vec::new())
                }
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    struct RecordingSink(Vec<(String, Telemetry)>);

    impl TelemetrySink for RecordingSink {
        fn record(&mut self, partition: &str, telemetry: Telemetry) {
            self.0.push((partition.to_string(), telemetry));
        }
    }

    struct ScriptedStream {
        scripts: Mutex<HashMap<String, Vec<Step>>>,
        opened: Mutex<Vec<String>>,
        stop: Arc<AtomicBool>,
    }

    impl ScriptedStream {
        fn new(scripts: HashMap<String, Vec<Step>>, stop: Arc<AtomicBool>) -> ScriptedStream {
            ScriptedStream {
                scripts: Mutex::new(scripts),
                opened: Mutex::new(Vec::new()),
                stop,
            }
        }
    }

    impl EventStream for ScriptedStream {
        type Reader = ScriptedReader;

        fn partitions(&self) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self.scripts.lock().unwrap().keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        fn open_reader(&self, partition: &str) -> Result<ScriptedReader> {
            self.opened.lock().unwrap().push(partition.to_string());
            let steps = self
                .scripts
                .lock()
                .unwrap()
                .remove(partition)
                .unwrap_or_default();
            Ok(ScriptedReader::new(partition, steps, Arc::clone(&self.stop)))
        }
    }

    fn options() -> ReaderOptions {
        ReaderOptions::default()
    }

    #[test]
    fn processes_events_in_receipt_order() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = ScriptedReader::new(
            "0",
            vec![
                Step::Batch(vec![
                    event("a", json!({})),
                    event("b", json!({})),
                ]),
                Step::Batch(vec![event("c", json!({}))]),
            ],
            Arc::clone(&stop),
        );
        let mut sink = RecordingSink(Vec::new());

        let count = read_partition("0", &mut reader, &options(), &stop, &mut sink).unwrap();

        assert_eq!(count, 3);
        let bodies: Vec<&str> = sink.0.iter().map(|(_, t)| t.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_batches_are_not_errors() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = ScriptedReader::new(
            "0",
            vec![Step::Empty, Step::Empty, Step::Batch(vec![event("late", json!({}))])],
            Arc::clone(&stop),
        );
        let mut sink = RecordingSink(Vec::new());

        let count = read_partition("0", &mut reader, &options(), &stop, &mut sink).unwrap();

        assert_eq!(count, 1);
        assert_eq!(sink.0[0].1.body, "late");
    }

    #[test]
    fn decode_failure_does_not_stop_the_partition() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = ScriptedReader::new(
            "1",
            vec![Step::Batch(vec![
                event("before", json!({})),
                bad_event(),
                event("after", json!({})),
            ])],
            Arc::clone(&stop),
        );
        let mut sink = RecordingSink(Vec::new());

        let count = read_partition("1", &mut reader, &options(), &stop, &mut sink).unwrap();

        assert_eq!(count, 2);
        let bodies: Vec<&str> = sink.0.iter().map(|(_, t)| t.body.as_str()).collect();
        assert_eq!(bodies, vec!["before", "after"]);
    }

    #[test]
    fn alert_flags_surface_with_the_event() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = ScriptedReader::new(
            "0",
            vec![Step::Batch(vec![event(
                "temp=21",
                json!({"highTemp": "true"}),
            )])],
            Arc::clone(&stop),
        );
        let mut sink = RecordingSink(Vec::new());

        read_partition("0", &mut reader, &options(), &stop, &mut sink).unwrap();

        let (partition, telemetry) = &sink.0[0];
        assert_eq!(partition, "0");
        assert!(telemetry.body.contains("temp=21"));
        assert_eq!(telemetry.alerts, vec!["highTemp"]);
    }

    #[test]
    fn raised_stop_flag_ends_the_loop_cleanly() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut reader = ScriptedReader::new("0", vec![Step::Fail], Arc::clone(&stop));
        let mut sink = RecordingSink(Vec::new());

        let count = read_partition("0", &mut reader, &options(), &stop, &mut sink).unwrap();

        assert_eq!(count, 0);
        assert!(reader.closed);
        assert_eq!(reader.steps.len(), 1); // never called receive
    }

    #[test]
    fn fatal_receive_error_is_terminal() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = ScriptedReader::new("2", vec![Step::Fail], Arc::clone(&stop));
        let mut sink = RecordingSink(Vec::new());

        let err = read_partition("2", &mut reader, &options(), &stop, &mut sink).unwrap_err();

        assert!(matches!(err, Error::StreamRead { partition, .. } if partition == "2"));
    }

    #[test]
    fn one_reader_per_distinct_partition() {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(ScriptedStream::new(
            HashMap::from([("0".to_string(), vec![]), ("1".to_string(), vec![])]),
            Arc::clone(&stop),
        ));
        let partitions = vec![
            "0".to_string(),
            "1".to_string(),
            "0".to_string(), // duplicate, must not double-read
        ];

        let summary = run(Arc::clone(&stream), &partitions, options(), stop).unwrap();

        let mut opened = stream.opened.lock().unwrap().clone();
        opened.sort();
        assert_eq!(opened, vec!["0", "1"]);
        assert_eq!(summary.clean.len(), 2);
        assert!(summary.failed.is_empty());
    }

    #[test]
    fn two_partition_scenario() {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(ScriptedStream::new(
            HashMap::from([
                (
                    "0".to_string(),
                    vec![Step::Batch(vec![event("temp=21", json!({"highTemp": "true"}))])],
                ),
                ("1".to_string(), vec![Step::Empty]),
            ]),
            Arc::clone(&stop),
        ));
        let partitions = stream.partitions().unwrap();

        let summary = run(Arc::clone(&stream), &partitions, options(), stop).unwrap();

        assert_eq!(stream.opened.lock().unwrap().len(), 2);
        let mut clean = summary.clean.clone();
        clean.sort();
        assert_eq!(clean, vec!["0", "1"]);
    }

    #[test]
    fn one_dead_reader_does_not_stop_the_rest() {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(ScriptedStream::new(
            HashMap::from([
                ("0".to_string(), vec![Step::Fail]),
                (
                    "1".to_string(),
                    vec![Step::Batch(vec![event("still here", json!({}))])],
                ),
            ]),
            Arc::clone(&stop),
        ));
        let partitions = stream.partitions().unwrap();

        let summary = run(Arc::clone(&stream), &partitions, options(), stop).unwrap();

        assert_eq!(summary.failed, vec!["0"]);
        assert_eq!(summary.clean, vec!["1"]);
    }

    #[test]
    fn all_readers_failing_is_an_error() {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = Arc::new(ScriptedStream::new(
            HashMap::from([
                ("0".to_string(), vec![Step::Fail]),
                ("1".to_string(), vec![Step::Fail]),
            ]),
            Arc::clone(&stop),
        ));
        let partitions = stream.partitions().unwrap();

        let err = run(Arc::clone(&stream), &partitions, options(), stop).unwrap_err();

        assert!(matches!(err, Error::AllReadersFailed(2)));
    }
}
