//! K-way chunk merger.

use std::cmp::Ordering;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::panic;
use std::path::Path;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::buffer::slot_less;
use crate::chunk::ChunkReader;
use crate::codec::{RecordCodec, RmpCodec};
use crate::file::{Compression, Sink};
use crate::record::Record;
use crate::sort::SortError;

/// Default number of decoded records buffered across all chunk queues.
pub const DEFAULT_QUEUE_BUDGET: usize = 10_000;

type MergeError<T, C> =
    SortError<<C as RecordCodec<T>>::SerializationError, <C as RecordCodec<T>>::DeserializationError>;

/// One-shot completion token handed to a streaming merge consumer.
///
/// [`KWayMerger::merge_streaming`] does not return until the token is consumed by [`DoneSignal::done`] or
/// dropped.
pub struct DoneSignal {
    sender: Sender<()>,
}

impl DoneSignal {
    /// Signals that the consumer finished processing the merged stream.
    pub fn done(self) {
        // the merge is waiting on the other side, it can't be gone
        let _ = self.sender.send(());
    }
}

/// Current head record of every chunk.
struct Frontier<T, E> {
    slots: Vec<Option<T>>,
    queues: Vec<Option<Receiver<Result<T, E>>>>,
}

impl<T, E> Frontier<T, E> {
    fn new(queues: Vec<Receiver<Result<T, E>>>) -> Self {
        Frontier {
            slots: queues.iter().map(|_| None).collect(),
            queues: queues.into_iter().map(Some).collect(),
        }
    }

    /// Fills every empty slot whose chunk is not exhausted yet, blocking until the chunk reader delivers
    /// the next record or closes its queue.
    fn refill(&mut self) -> Result<(), E> {
        for (idx, (slot, queue)) in self.slots.iter_mut().zip(self.queues.iter_mut()).enumerate() {
            if slot.is_some() {
                continue;
            }
            let received = match queue {
                Some(queue) => match queue.try_recv() {
                    Ok(item) => Some(item),
                    Err(TryRecvError::Empty) => queue.recv().ok(),
                    Err(TryRecvError::Disconnected) => None,
                },
                None => continue,
            };

            match received {
                Some(Ok(item)) => *slot = Some(item),
                Some(Err(err)) => return Err(err),
                None => {
                    log::debug!("chunk {} exhausted", idx);
                    *queue = None;
                }
            }
        }

        return Ok(());
    }

    /// Takes the minimal head record. Equal records are taken in chunk order.
    fn pop_min<F>(&mut self, compare: &F) -> Option<T>
    where
        F: Fn(&T, &T) -> Ordering,
    {
        let mut min_idx = 0;
        for idx in 1..self.slots.len() {
            if slot_less(self.slots[idx].as_ref(), self.slots[min_idx].as_ref(), compare) {
                min_idx = idx;
            }
        }

        self.slots.get_mut(min_idx)?.take()
    }
}

/// Decodes the chunk on a dedicated thread, pushing records to a bounded queue.
/// The queue is closed after the last record or right after a forwarded error.
fn spawn_reader<'scope, 'env, T, C>(
    scope: &'scope thread::Scope<'scope, 'env>,
    reader: ChunkReader<T, C>,
    capacity: usize,
) -> Receiver<Result<T, MergeError<T, C>>>
where
    T: Send + 'scope,
    C: RecordCodec<T> + Send + 'scope,
{
    let (sender, receiver) = crossbeam_channel::bounded(capacity);

    scope.spawn(move || {
        for item in reader {
            let failed = item.is_err();
            if sender.send(item).is_err() || failed {
                break;
            }
        }
    });

    return receiver;
}

/// Runs the merge loop until every chunk is exhausted or `emit` reports that the downstream is gone.
/// Returns the number of emitted records.
fn merge_queues<T, E, F, O>(
    queues: Vec<Receiver<Result<T, E>>>,
    compare: &F,
    dedup: bool,
    mut emit: O,
) -> Result<u64, E>
where
    T: Record,
    F: Fn(&T, &T) -> Ordering,
    O: FnMut(T) -> Result<bool, E>,
{
    let mut frontier = Frontier::new(queues);
    let mut last_rendered: Option<String> = None;
    let mut emitted: u64 = 0;
    let mut duplicates: u64 = 0;

    loop {
        frontier.refill()?;
        let item = match frontier.pop_min(compare) {
            Some(item) => item,
            None => break,
        };

        if dedup {
            let rendered = item.render();
            if last_rendered.as_ref() == Some(&rendered) {
                duplicates += 1;
                continue;
            }
            last_rendered = Some(rendered);
        }

        if !emit(item)? {
            log::debug!("merge output closed by consumer after {} records", emitted);
            break;
        }
        emitted += 1;
    }

    log::debug!("merge done (emitted: {}, duplicates skipped: {})", emitted, duplicates);

    return Ok(emitted);
}

/// K-way merger implementation.
/// Merges sorted chunk files into a single sorted output. Every chunk is decoded on its own thread, a
/// coordinator keeps the head record of every chunk and repeatedly emits the minimal one.
/// Time complexity is *m* \* *n* where *m* is the number of records, *n* is the number of chunks.
pub struct KWayMerger<T, C = RmpCodec<T>> {
    /// Decoded records buffered across all chunk queues.
    queue_budget: usize,
    /// Collapse consecutive records with equal rendered text.
    dedup: bool,
    /// Chunk and output file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Output zstd compression level.
    compression_level: i32,

    /// Record codec type.
    codec_type: PhantomData<C>,
    /// Record type.
    item_type: PhantomData<T>,
}

impl<T, C> Default for KWayMerger<T, C> {
    fn default() -> Self {
        KWayMerger {
            queue_budget: DEFAULT_QUEUE_BUDGET,
            dedup: false,
            rw_buf_size: None,
            compression_level: 0,
            codec_type: PhantomData,
            item_type: PhantomData,
        }
    }
}

impl<T, C> KWayMerger<T, C>
where
    T: Record,
    C: RecordCodec<T> + Send,
{
    /// Creates a merger with default parameters.
    pub fn new() -> Self {
        KWayMerger::default()
    }

    /// Sets the number of decoded records buffered across all chunk queues.
    /// Every chunk gets an equal share, but at least one record.
    pub fn with_queue_budget(mut self, budget: usize) -> Self {
        self.queue_budget = budget;
        return self;
    }

    /// Enables consecutive duplicate suppression: records whose rendered text equals the previously emitted one
    /// are skipped. Applies to both streaming and file merges.
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        return self;
    }

    /// Sets chunk and output file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets output compression level used when the output path has the compressed extension.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        return self;
    }

    fn queue_capacity(&self, chunks_number: usize) -> usize {
        (self.queue_budget / chunks_number.max(1)).max(1)
    }

    fn open_chunks<P>(&self, chunks: &[P]) -> Result<Vec<ChunkReader<T, C>>, MergeError<T, C>>
    where
        P: AsRef<Path>,
    {
        chunks
            .iter()
            .map(|path| {
                ChunkReader::open(path.as_ref(), self.rw_buf_size).map_err(|err| {
                    log::error!("chunk {} opening error: {}", path.as_ref().display(), err);
                    SortError::IO(err)
                })
            })
            .collect()
    }

    /// Merges chunks into a channel consumed by `on_ready`.
    ///
    /// `on_ready` is started on its own thread with the receiving side of `output` and a [`DoneSignal`]. The
    /// call blocks until the signal is consumed or dropped, so the consumer can fully drain and check the
    /// stream before the merge returns. The sending side is closed once all chunks are merged. If the consumer
    /// drops the receiver early, the merge stops and returns normally.
    /// Returns the number of records sent to `output`.
    ///
    /// # Arguments
    /// * `chunks` - Sorted chunk files
    /// * `compare` - Function the chunks were sorted with
    /// * `output` - Channel the merged records are sent to
    /// * `on_ready` - Consumer of the merged records
    pub fn merge_streaming<P, F, R>(
        &self,
        chunks: &[P],
        compare: F,
        output: (Sender<T>, Receiver<T>),
        on_ready: R,
    ) -> Result<u64, MergeError<T, C>>
    where
        P: AsRef<Path>,
        F: Fn(&T, &T) -> Ordering + Sync,
        R: FnOnce(Receiver<T>, DoneSignal) + Send,
    {
        let readers = self.open_chunks(chunks)?;
        let capacity = self.queue_capacity(readers.len());
        let dedup = self.dedup;
        let (sender, receiver) = output;
        let (done_sender, done_receiver) = crossbeam_channel::bounded(1);

        log::debug!("merging {} chunks into stream (queue capacity: {})", readers.len(), capacity);

        thread::scope(|scope| {
            let queues: Vec<_> = readers
                .into_iter()
                .map(|reader| spawn_reader(scope, reader, capacity))
                .collect();

            let compare = &compare;
            let coordinator =
                scope.spawn(move || merge_queues(queues, compare, dedup, |item| Ok(sender.send(item).is_ok())));

            scope.spawn(move || {
                on_ready(
                    receiver,
                    DoneSignal {
                        sender: done_sender,
                    },
                )
            });

            // a dropped signal means the consumer is gone as well
            let _ = done_receiver.recv();

            match coordinator.join() {
                Ok(result) => result,
                Err(err) => panic::resume_unwind(err),
            }
        })
    }

    /// Merges chunks into the output file, one rendered record per line without a trailing line break.
    /// The output is zstd compressed if its path has the compressed extension.
    /// Returns the number of written records.
    ///
    /// # Arguments
    /// * `chunks` - Sorted chunk files
    /// * `output` - Output file path, an existing file is truncated
    /// * `compare` - Function the chunks were sorted with
    pub fn merge_to_file<P, F>(&self, chunks: &[P], output: &Path, compare: F) -> Result<u64, MergeError<T, C>>
    where
        P: AsRef<Path>,
        F: Fn(&T, &T) -> Ordering,
    {
        let readers = self.open_chunks(chunks)?;
        let capacity = self.queue_capacity(readers.len());

        let mut sink = Sink::create(
            output,
            Compression::from_path(output),
            self.compression_level,
            self.rw_buf_size,
        )
        .map_err(SortError::IO)?;

        log::debug!("merging {} chunks into {}", readers.len(), output.display());

        let merged = thread::scope(|scope| {
            let queues: Vec<_> = readers
                .into_iter()
                .map(|reader| spawn_reader(scope, reader, capacity))
                .collect();

            let mut first = true;
            merge_queues(queues, &compare, self.dedup, |item| {
                if !first {
                    sink.write_all(b"\n").map_err(SortError::IO)?;
                }
                sink.write_all(item.render().as_bytes()).map_err(SortError::IO)?;
                first = false;

                Ok(true)
            })
        })?;

        sink.finish().map_err(SortError::IO)?;

        return Ok(merged);
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;
    use std::fs;
    use std::path::{Path, PathBuf};

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::KWayMerger;
    use crate::chunk::write_chunk;
    use crate::codec::RmpCodec;
    use crate::record::Record;
    use crate::sort::{ExternalSorter, ExternalSorterBuilder, SortError};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_chunks<T>(dir: &Path, chunks: Vec<Vec<T>>) -> Vec<PathBuf>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        chunks
            .into_iter()
            .enumerate()
            .map(|(idx, items)| {
                let path = dir.join(format!("test.chunk.{:08}.zst", idx));
                write_chunk::<T, RmpCodec<T>>(&path, &items, 0, None).unwrap();
                path
            })
            .collect()
    }

    fn collect_streaming<T>(merger: &KWayMerger<T>, chunks: &[PathBuf], compare: fn(&T, &T) -> Ordering) -> Vec<T>
    where
        T: Record + serde::Serialize + serde::de::DeserializeOwned,
    {
        let mut received = Vec::new();
        let emitted = merger
            .merge_streaming(chunks, compare, crossbeam_channel::bounded(4), |records, done| {
                received.extend(records.iter());
                done.done();
            })
            .unwrap();
        assert_eq!(emitted as usize, received.len());

        return received;
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Tagged {
        key: i32,
        tag: String,
    }

    impl Record for Tagged {
        fn render(&self) -> String {
            format!("{}:{}", self.key, self.tag)
        }
    }

    fn tagged(key: i32, tag: &str) -> Tagged {
        Tagged { key, tag: tag.into() }
    }

    fn by_key(a: &Tagged, b: &Tagged) -> Ordering {
        a.key.cmp(&b.key)
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![vec![], vec![]], vec![])]
    #[case(
        vec![
            vec![4, 5, 7],
            vec![1, 6],
            vec![3],
            vec![],
        ],
        vec![1, 3, 4, 5, 6, 7],
    )]
    #[case(
        vec![
            vec![1, 1, 2],
            vec![1, 2, 2],
        ],
        vec![1, 1, 1, 2, 2, 2],
    )]
    fn test_merger(tmp_dir: tempfile::TempDir, #[case] chunks: Vec<Vec<i32>>, #[case] expected: Vec<i32>) {
        let chunks = write_chunks(tmp_dir.path(), chunks);
        let merger = KWayMerger::<i32>::new();

        assert_eq!(collect_streaming(&merger, &chunks, i32::cmp), expected);

        let output = tmp_dir.path().join("output.txt");
        let written = merger.merge_to_file(&chunks, &output, i32::cmp).unwrap();
        assert_eq!(written as usize, expected.len());

        let expected_text: Vec<String> = expected.iter().map(i32::to_string).collect();
        assert_eq!(fs::read_to_string(&output).unwrap(), expected_text.join("\n"));
    }

    #[rstest]
    fn test_ties_broken_by_chunk_order(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(
            tmp_dir.path(),
            vec![
                vec![tagged(1, "a0"), tagged(2, "a1")],
                vec![tagged(1, "b0"), tagged(2, "b1")],
                vec![tagged(0, "c0"), tagged(2, "c1")],
            ],
        );
        let merger = KWayMerger::<Tagged>::new();

        let merged = collect_streaming(&merger, &chunks, by_key);
        let rendered: Vec<String> = merged.iter().map(Record::render).collect();
        assert_eq!(rendered, vec!["0:c0", "1:a0", "1:b0", "2:a1", "2:b1", "2:c1"]);
    }

    #[rstest]
    fn test_dedup(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(tmp_dir.path(), vec![vec![1, 2, 2, 3], vec![2, 3, 4], vec![4]]);
        let merger = KWayMerger::<i32>::new().with_dedup(true);

        assert_eq!(collect_streaming(&merger, &chunks, i32::cmp), vec![1, 2, 3, 4]);

        let output = tmp_dir.path().join("output.txt");
        let written = merger.merge_to_file(&chunks, &output, i32::cmp).unwrap();
        assert_eq!(written, 4);
        assert_eq!(fs::read_to_string(&output).unwrap(), "1\n2\n3\n4");
    }

    #[rstest]
    fn test_dedup_uses_rendered_text(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(
            tmp_dir.path(),
            vec![vec![tagged(1, "x"), tagged(1, "y")], vec![tagged(1, "x")]],
        );
        let merger = KWayMerger::<Tagged>::new().with_dedup(true);

        let merged = collect_streaming(&merger, &chunks, by_key);
        // equal keys but different renders are kept, consecutive equal renders collapse
        assert_eq!(merged, vec![tagged(1, "x"), tagged(1, "y"), tagged(1, "x")]);
    }

    #[rstest]
    fn test_small_queue_budget(tmp_dir: tempfile::TempDir) {
        let chunks: Vec<Vec<i32>> = (0..8).map(|offset| (0..50).map(|i| i * 8 + offset).collect()).collect();
        let chunks = write_chunks(tmp_dir.path(), chunks);
        let merger = KWayMerger::<i32>::new().with_queue_budget(3).with_rw_buf_size(64);

        assert_eq!(merger.queue_capacity(chunks.len()), 1);
        assert_eq!(collect_streaming(&merger, &chunks, i32::cmp), Vec::from_iter(0..400));
    }

    #[rstest]
    #[case(10_000, 3, 3_333)]
    #[case(10_000, 0, 10_000)]
    #[case(10, 20, 1)]
    fn test_queue_capacity(#[case] budget: usize, #[case] chunks: usize, #[case] expected: usize) {
        let merger = KWayMerger::<i32>::new().with_queue_budget(budget);
        assert_eq!(merger.queue_capacity(chunks), expected);
    }

    #[rstest]
    fn test_consumer_abandons_stream(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(tmp_dir.path(), vec![Vec::from_iter(0..1000), Vec::from_iter(1000..2000)]);
        let merger = KWayMerger::<i32>::new().with_queue_budget(2);

        let mut received = Vec::new();
        let emitted = merger
            .merge_streaming(&chunks, i32::cmp, crossbeam_channel::bounded(1), |records, done| {
                received.extend(records.iter().take(2));
                drop(records);
                done.done();
            })
            .unwrap();

        assert_eq!(received, vec![0, 1]);
        assert!(emitted < 2000);
    }

    #[rstest]
    fn test_consumer_drops_signal(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(tmp_dir.path(), vec![vec![2, 4], vec![1, 3]]);
        let merger = KWayMerger::<i32>::new();

        let mut received = Vec::new();
        merger
            .merge_streaming(&chunks, i32::cmp, crossbeam_channel::bounded(8), |records, _done| {
                received.extend(records.iter());
            })
            .unwrap();

        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[rstest]
    fn test_missing_chunk(tmp_dir: tempfile::TempDir) {
        let chunks = vec![tmp_dir.path().join("missing.chunk.00000000.zst")];
        let output = tmp_dir.path().join("output.txt");

        let result = KWayMerger::<i32>::new().merge_to_file(&chunks, &output, i32::cmp);
        assert!(matches!(result, Err(SortError::IO(_))));
    }

    #[rstest]
    fn test_corrupted_chunk(tmp_dir: tempfile::TempDir) {
        let mut chunks = write_chunks(tmp_dir.path(), vec![vec![1, 2, 3]]);
        let broken = tmp_dir.path().join("broken.chunk.00000000.zst");
        let mut sink =
            crate::file::Sink::create(&broken, crate::file::Compression::Zstd, 0, None).unwrap();
        std::io::Write::write_all(&mut sink, &5u64.to_le_bytes()).unwrap();
        sink.finish().unwrap();
        chunks.push(broken);

        let output = tmp_dir.path().join("output.txt");
        let result = KWayMerger::<i32>::new().merge_to_file(&chunks, &output, i32::cmp);
        assert!(matches!(result, Err(SortError::DeserializationError(_))));

        let mut received = Vec::new();
        let result = KWayMerger::<i32>::new().merge_streaming(
            &chunks,
            i32::cmp,
            crossbeam_channel::bounded(8),
            |records, done| {
                received.extend(records.iter());
                done.done();
            },
        );
        assert!(matches!(result, Err(SortError::DeserializationError(_))));
    }

    #[rstest]
    fn test_compressed_output(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(
            tmp_dir.path(),
            vec![vec!["b".to_string(), "d".into()], vec!["a".into(), "c".into()]],
        );
        let output = tmp_dir.path().join("output.txt.zst");

        KWayMerger::<String>::new()
            .with_compression_level(5)
            .merge_to_file(&chunks, &output, String::cmp)
            .unwrap();

        let lines: Vec<String> = std::io::BufRead::lines(crate::file::open_lines(&output, None).unwrap())
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
    }

    fn int_sorter(budget: u64) -> ExternalSorter<i64> {
        ExternalSorterBuilder::new()
            .with_memory_budget(budget)
            .with_threads_number(2)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(64)]
    #[case(u64::MAX)]
    fn test_round_trip(tmp_dir: tempfile::TempDir, #[case] budget: u64) {
        let mut numbers = Vec::from_iter(-150i64..150);
        numbers.extend(0..50);
        numbers.shuffle(&mut rand::thread_rng());
        let lines: Vec<String> = numbers.iter().map(i64::to_string).collect();
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, lines.join("\n")).unwrap();

        let chunks = int_sorter(budget).split(&input, |line| line.parse::<i64>()).unwrap();

        let mut expected = numbers.clone();
        expected.sort();

        let merged = collect_streaming(&KWayMerger::<i64>::new(), &chunks, i64::cmp);
        assert_eq!(merged, expected);
        assert!(merged.windows(2).all(|pair| pair[0] <= pair[1]));

        let output = tmp_dir.path().join("output.txt");
        KWayMerger::<i64>::new()
            .merge_to_file(&chunks, &output, i64::cmp)
            .unwrap();
        let expected_text: Vec<String> = expected.iter().map(i64::to_string).collect();
        assert_eq!(fs::read_to_string(&output).unwrap(), expected_text.join("\n"));
    }

    #[rstest]
    #[case("output.txt")]
    #[case("output.txt.zst")]
    fn test_deterministic_output(tmp_dir: tempfile::TempDir, #[case] name: &str) {
        let mut records = Vec::new();
        for key in 0..40 {
            for tag in ["x", "y", "z"] {
                records.push(tagged(key % 7, &format!("{}{}", tag, key)));
            }
        }
        records.shuffle(&mut rand::thread_rng());
        let lines: Vec<String> = records.iter().map(Record::render).collect();
        let input = tmp_dir.path().join("input.txt");
        fs::write(&input, lines.join("\n")).unwrap();

        let parse = |line: &str| -> Result<Tagged, String> {
            let (key, tag) = line.split_once(':').ok_or_else(|| format!("no separator in {}", line))?;
            let key = key.parse::<i32>().map_err(|err| format!("{}", err))?;
            Ok(tagged(key, tag))
        };

        let mut outputs = Vec::new();
        for run in 0..2 {
            let sorter: ExternalSorter<Tagged> = ExternalSorterBuilder::new().with_memory_budget(50).build().unwrap();
            let chunks = sorter.split_by(&input, parse, by_key).unwrap();

            let output = tmp_dir.path().join(format!("{}.{}", run, name));
            KWayMerger::<Tagged>::new()
                .merge_to_file(&chunks, &output, by_key)
                .unwrap();
            outputs.push(fs::read(&output).unwrap());
            chunks.iter().for_each(|chunk| fs::remove_file(chunk).unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
    }

    fn failing_compare(_: &i32, _: &i32) -> Ordering {
        panic!("comparator failure");
    }

    #[rstest]
    #[should_panic(expected = "comparator failure")]
    fn test_comparator_panic_in_file_merge(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(tmp_dir.path(), vec![vec![1, 3], vec![2, 4]]);
        let output = tmp_dir.path().join("output.txt");

        let _ = KWayMerger::<i32>::new().merge_to_file(&chunks, &output, failing_compare);
    }

    #[rstest]
    #[should_panic(expected = "comparator failure")]
    fn test_comparator_panic_in_streaming_merge(tmp_dir: tempfile::TempDir) {
        let chunks = write_chunks(tmp_dir.path(), vec![vec![1, 3], vec![2, 4]]);

        let _ = KWayMerger::<i32>::new().merge_streaming(
            &chunks,
            failing_compare,
            crossbeam_channel::bounded(1),
            |records, done| {
                for _ in records {}
                done.done();
            },
        );
    }
}
