//! Dataset loading and batching.
//!
//! - [`SftDataset`] - `{"instruction", "input", "output"}` records
//! - [`PreferenceDataset`] - `{"prompt", "chosen", "rejected"}` records
//! - [`epoch_order`] - seeded per-epoch shuffle
//! - [`stream_batches`] - minibatches assembled by a producer thread ahead of the consumer
//!
//! Every sequence is tokenized, terminated with the end token, truncated and
//! padded to `max_length`. Labels equal the input ids; padded positions carry
//! `pad_id`, which the loss ignores.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::embedding::ids_tensor;
use crate::error::{RapportError, Result};
use crate::tokenizer::TextEncoder;

/// Marker between a prompt and its answer in rendered sequences.
pub const ANSWER_MARKER: &str = "Answer:";

/// Supervised example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRecord {
    /// Task description
    pub instruction: String,
    /// Optional context
    #[serde(default)]
    pub input: String,
    /// Target response
    pub output: String,
}

/// Preference example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    /// Shared prompt
    pub prompt: String,
    /// Preferred response
    pub chosen: String,
    /// Dispreferred response
    pub rejected: String,
}

/// Render an SFT record into one prompt+answer text.
pub fn render_sft(record: &SftRecord) -> String {
    if record.input.trim().is_empty() {
        format!("{}\n\n{ANSWER_MARKER} {}", record.instruction, record.output)
    } else {
        format!(
            "{}\n\n{}\n\n{ANSWER_MARKER} {}",
            record.instruction, record.input, record.output
        )
    }
}

/// Render a prompt with one candidate response.
pub fn render_preference(prompt: &str, response: &str) -> String {
    format!("{prompt}\n\n{ANSWER_MARKER} {response}")
}

/// Render the prompt part only, ready for generation.
pub fn render_prompt(prompt: &str) -> String {
    format!("{prompt}\n\n{ANSWER_MARKER}")
}

/// One fixed-length tokenized sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedSequence {
    /// Token ids, padded to `max_length`
    pub input_ids: Vec<u32>,
    /// 1 on real tokens, 0 on padding
    pub attention_mask: Vec<u32>,
    /// Targets; `pad_id` marks ignored positions
    pub labels: Vec<u32>,
}

impl EncodedSequence {
    /// Number of non-pad positions.
    pub fn real_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// Tokenize `text`, append the end token, truncate and pad to `max_length`.
pub fn encode_padded(
    encoder: &dyn TextEncoder,
    text: &str,
    max_length: usize,
) -> Result<EncodedSequence> {
    let mut ids = encoder.encode(text)?;
    ids.push(encoder.eos_id());
    ids.truncate(max_length);

    let real = ids.len();
    ids.resize(max_length, encoder.pad_id());
    let attention_mask = (0..max_length).map(|i| u32::from(i < real)).collect();

    Ok(EncodedSequence {
        labels: ids.clone(),
        input_ids: ids,
        attention_mask,
    })
}

/// Parse a JSONL file, skipping lines that fail to parse.
///
/// Returns the parsed records and the number of skipped lines. Blank lines
/// are ignored without counting.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let file = File::open(path).map_err(|e| {
        RapportError::dataset(format!("cannot open {}: {e}", path.display()))
    })?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                tracing::warn!("skipping malformed line {} in {}: {e}", line_no + 1, path.display());
            }
        }
    }
    Ok((records, skipped))
}

/// Tokenized supervised dataset.
#[derive(Debug, Clone)]
pub struct SftDataset {
    examples: Vec<EncodedSequence>,
    skipped: usize,
}

impl SftDataset {
    /// Load and tokenize a JSONL file.
    ///
    /// Fails with [`RapportError::DatasetEmpty`] when no line is usable.
    pub fn load(path: impl AsRef<Path>, encoder: &dyn TextEncoder, max_length: usize) -> Result<Self> {
        let path = path.as_ref();
        let (records, skipped) = read_jsonl::<SftRecord>(path)?;
        if records.is_empty() {
            return Err(RapportError::DatasetEmpty {
                path: path.display().to_string(),
            });
        }
        let mut dataset = Self::from_records(&records, encoder, max_length)?;
        dataset.skipped = skipped;
        tracing::info!(
            "Loaded {} SFT examples from {} ({} skipped)",
            dataset.len(),
            path.display(),
            skipped
        );
        Ok(dataset)
    }

    /// Tokenize in-memory records.
    pub fn from_records(
        records: &[SftRecord],
        encoder: &dyn TextEncoder,
        max_length: usize,
    ) -> Result<Self> {
        let examples = records
            .iter()
            .map(|r| encode_padded(encoder, &render_sft(r), max_length))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_sequences(examples))
    }

    /// Wrap already tokenized sequences.
    pub fn from_sequences(examples: Vec<EncodedSequence>) -> Self {
        Self {
            examples,
            skipped: 0,
        }
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset has no examples.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Malformed lines skipped during loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// All examples.
    pub fn examples(&self) -> &[EncodedSequence] {
        &self.examples
    }
}

/// Chosen and rejected continuations of one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferencePair {
    /// prompt + chosen
    pub chosen: EncodedSequence,
    /// prompt + rejected
    pub rejected: EncodedSequence,
}

/// Tokenized preference dataset.
#[derive(Debug, Clone)]
pub struct PreferenceDataset {
    pairs: Vec<PreferencePair>,
    skipped: usize,
}

impl PreferenceDataset {
    /// Load and tokenize a JSONL file.
    pub fn load(path: impl AsRef<Path>, encoder: &dyn TextEncoder, max_length: usize) -> Result<Self> {
        let path = path.as_ref();
        let (records, skipped) = read_jsonl::<PreferenceRecord>(path)?;
        if records.is_empty() {
            return Err(RapportError::DatasetEmpty {
                path: path.display().to_string(),
            });
        }
        let mut dataset = Self::from_records(&records, encoder, max_length)?;
        dataset.skipped = skipped;
        tracing::info!(
            "Loaded {} preference pairs from {} ({} skipped)",
            dataset.len(),
            path.display(),
            skipped
        );
        Ok(dataset)
    }

    /// Tokenize in-memory records.
    pub fn from_records(
        records: &[PreferenceRecord],
        encoder: &dyn TextEncoder,
        max_length: usize,
    ) -> Result<Self> {
        let pairs = records
            .iter()
            .map(|r| {
                Ok(PreferencePair {
                    chosen: encode_padded(encoder, &render_preference(&r.prompt, &r.chosen), max_length)?,
                    rejected: encode_padded(
                        encoder,
                        &render_preference(&r.prompt, &r.rejected),
                        max_length,
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pairs, skipped: 0 })
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the dataset has no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Malformed lines skipped during loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// All pairs.
    pub fn pairs(&self) -> &[PreferencePair] {
        &self.pairs
    }
}

/// Device-resident minibatch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, max_length)` u32
    pub input_ids: Tensor,
    /// `(batch, max_length)` u32
    pub attention_mask: Tensor,
    /// `(batch, max_length)` u32
    pub labels: Tensor,
}

impl Batch {
    /// Number of sequences.
    pub fn size(&self) -> usize {
        self.input_ids.dims()[0]
    }
}

/// Stack sequences into a [`Batch`].
pub fn collate(sequences: &[&EncodedSequence], device: &Device) -> Result<Batch> {
    let input_ids: Vec<Vec<u32>> = sequences.iter().map(|s| s.input_ids.clone()).collect();
    let mask: Vec<Vec<u32>> = sequences.iter().map(|s| s.attention_mask.clone()).collect();
    let labels: Vec<Vec<u32>> = sequences.iter().map(|s| s.labels.clone()).collect();
    Ok(Batch {
        input_ids: ids_tensor(&input_ids, device)?,
        attention_mask: ids_tensor(&mask, device)?,
        labels: ids_tensor(&labels, device)?,
    })
}

/// Chosen and rejected halves of a preference minibatch.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    /// prompt + chosen sequences
    pub chosen: Batch,
    /// prompt + rejected sequences
    pub rejected: Batch,
}

/// Stack preference pairs into a [`PreferenceBatch`].
pub fn collate_pairs(pairs: &[&PreferencePair], device: &Device) -> Result<PreferenceBatch> {
    let chosen: Vec<&EncodedSequence> = pairs.iter().map(|p| &p.chosen).collect();
    let rejected: Vec<&EncodedSequence> = pairs.iter().map(|p| &p.rejected).collect();
    Ok(PreferenceBatch {
        chosen: collate(&chosen, device)?,
        rejected: collate(&rejected, device)?,
    })
}

/// Shuffled example order for one epoch; reproducible from `(seed, epoch)`.
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);
    order
}

/// Number of minibatches of `batch_size` over `len` items (last may be short).
pub fn num_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

/// Feed minibatches of `items`, visited in `order`, to `consume`.
///
/// With `prefetch > 0` a producer thread builds up to `prefetch` batches
/// ahead of the consumer through a bounded channel; with 0 everything runs
/// on the calling thread. An error from either side stops the stream and is
/// returned.
pub fn stream_batches<T, B, M, C>(
    items: &[T],
    order: &[usize],
    batch_size: usize,
    prefetch: usize,
    make: M,
    mut consume: C,
) -> Result<()>
where
    T: Sync,
    B: Send,
    M: Fn(&[&T]) -> Result<B> + Sync,
    C: FnMut(usize, B) -> Result<()>,
{
    let batch_size = batch_size.max(1);

    if prefetch == 0 {
        for (idx, chunk) in order.chunks(batch_size).enumerate() {
            consume(idx, make(&pick(items, chunk))?)?;
        }
        return Ok(());
    }

    thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel::<Result<B>>(prefetch);
        let make = &make;
        scope.spawn(move || {
            for chunk in order.chunks(batch_size) {
                if tx.send(make(&pick(items, chunk))).is_err() {
                    break;
                }
            }
        });

        for (idx, batch) in rx.iter().enumerate() {
            consume(idx, batch?)?;
        }
        Ok(())
    })
}

fn pick<'a, T>(items: &'a [T], chunk: &[usize]) -> Vec<&'a T> {
    chunk.iter().map(|&i| &items[i]).collect()
}

/// Write small SFT and preference files for smoke runs.
///
/// Returns `(sft_path, preference_path)`.
pub fn write_sample_data(dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let sft = [
        SftRecord {
            instruction: "How do I start a conversation with a new colleague?".into(),
            input: String::new(),
            output: "Introduce yourself, mention something you share, and ask an open question about their work.".into(),
        },
        SftRecord {
            instruction: "Rephrase this feedback so it sounds constructive.".into(),
            input: "Your report is a mess.".into(),
            output: "The report has good data; grouping it into clear sections would make it much easier to follow.".into(),
        },
        SftRecord {
            instruction: "How should I respond when someone interrupts me?".into(),
            input: String::new(),
            output: "Stay calm, let them finish, then say: I'd like to complete my thought, and I'll hear you right after.".into(),
        },
    ];
    let preferences = [
        PreferenceRecord {
            prompt: "A friend cancelled plans at the last minute. What do I say?".into(),
            chosen: "Tell them you were looking forward to it and suggest another day that works for both of you.".into(),
            rejected: "Tell them they always do this and you are done.".into(),
        },
        PreferenceRecord {
            prompt: "How do I decline an extra task from my manager?".into(),
            chosen: "Explain your current priorities and ask which one should move if the new task comes first.".into(),
            rejected: "Just ignore the request.".into(),
        },
    ];

    let sft_path = dir.join("sft_data.jsonl");
    let mut file = File::create(&sft_path)?;
    for record in &sft {
        writeln!(file, "{}", serde_json::to_string(record)?)?;
    }

    let pref_path = dir.join("preference_data.jsonl");
    let mut file = File::create(&pref_path)?;
    for record in &preferences {
        writeln!(file, "{}", serde_json::to_string(record)?)?;
    }

    tracing::info!("Wrote sample data to {}", dir.display());
    Ok((sft_path, pref_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteEncoder;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn jsonl(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_render_sft_template() {
        let with_input = SftRecord {
            instruction: "Fix".into(),
            input: "text".into(),
            output: "done".into(),
        };
        assert_eq!(render_sft(&with_input), "Fix\n\ntext\n\nAnswer: done");

        let without = SftRecord {
            input: String::new(),
            ..with_input
        };
        assert_eq!(render_sft(&without), "Fix\n\nAnswer: done");
    }

    #[test]
    fn test_encode_padded_layout() {
        let seq = encode_padded(&ByteEncoder, "ab", 6).unwrap();
        assert_eq!(seq.input_ids, vec![100, 101, ByteEncoder::EOS_ID, 0, 0, 0]);
        assert_eq!(seq.attention_mask, vec![1, 1, 1, 0, 0, 0]);
        assert_eq!(seq.labels, seq.input_ids);
        assert_eq!(seq.real_len(), 3);
    }

    #[test]
    fn test_encode_truncates() {
        let seq = encode_padded(&ByteEncoder, "abcdefgh", 4).unwrap();
        assert_eq!(seq.input_ids.len(), 4);
        assert!(seq.attention_mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let file = jsonl(&[
            r#"{"instruction": "a", "input": "", "output": "b"}"#,
            "not json",
            "",
            r#"{"instruction": "c"}"#,
            r#"{"instruction": "d", "output": "e"}"#,
        ]);
        let dataset = SftDataset::load(file.path(), &ByteEncoder, 32).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.skipped(), 2);
    }

    #[test]
    fn test_all_malformed_is_dataset_empty() {
        let file = jsonl(&["{", "[1, 2]"]);
        assert!(matches!(
            SftDataset::load(file.path(), &ByteEncoder, 32),
            Err(RapportError::DatasetEmpty { .. })
        ));
        assert!(matches!(
            PreferenceDataset::load(file.path(), &ByteEncoder, 32),
            Err(RapportError::DatasetEmpty { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_dataset_error() {
        assert!(matches!(
            SftDataset::load("/nonexistent/data.jsonl", &ByteEncoder, 32),
            Err(RapportError::Dataset(_))
        ));
    }

    #[test]
    fn test_preference_pairs_share_prompt() {
        let file = jsonl(&[r#"{"prompt": "hi", "chosen": "hello", "rejected": "go"}"#]);
        let dataset = PreferenceDataset::load(file.path(), &ByteEncoder, 24).unwrap();
        let pair = &dataset.pairs()[0];
        let prefix = ByteEncoder.encode("hi\n\nAnswer: ").unwrap();
        assert_eq!(&pair.chosen.input_ids[..prefix.len()], prefix.as_slice());
        assert_eq!(&pair.rejected.input_ids[..prefix.len()], prefix.as_slice());
        assert_ne!(pair.chosen, pair.rejected);
    }

    #[test]
    fn test_collate_shapes() {
        let a = encode_padded(&ByteEncoder, "x", 5).unwrap();
        let b = encode_padded(&ByteEncoder, "yz", 5).unwrap();
        let batch = collate(&[&a, &b], &Device::Cpu).unwrap();
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.input_ids.dims(), &[2, 5]);
        assert_eq!(batch.labels.dims(), &[2, 5]);
    }

    #[test]
    fn test_epoch_order_is_seeded_permutation() {
        let a = epoch_order(10, 42, 0);
        let b = epoch_order(10, 42, 0);
        let c = epoch_order(10, 42, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_num_batches_rounds_up() {
        assert_eq!(num_batches(5, 2), 3);
        assert_eq!(num_batches(4, 2), 2);
        assert_eq!(num_batches(0, 2), 0);
    }

    #[test]
    fn test_stream_batches_prefetch_matches_sequential() {
        let items: Vec<u32> = (0..7).collect();
        let order = vec![6, 5, 4, 3, 2, 1, 0];
        let make = |chunk: &[&u32]| -> Result<Vec<u32>> { Ok(chunk.iter().map(|&&x| x).collect()) };

        let mut sequential = Vec::new();
        stream_batches(&items, &order, 3, 0, make, |_, b| {
            sequential.push(b);
            Ok(())
        })
        .unwrap();

        let mut prefetched = Vec::new();
        stream_batches(&items, &order, 3, 2, make, |_, b| {
            prefetched.push(b);
            Ok(())
        })
        .unwrap();

        assert_eq!(sequential, vec![vec![6, 5, 4], vec![3, 2, 1], vec![0]]);
        assert_eq!(sequential, prefetched);
    }

    #[test]
    fn test_stream_batches_consumer_error_stops() {
        let items: Vec<u32> = (0..100).collect();
        let order: Vec<usize> = (0..100).collect();
        let mut seen = 0;
        let result = stream_batches(
            &items,
            &order,
            1,
            4,
            |chunk: &[&u32]| Ok(*chunk[0]),
            |idx, _| {
                seen += 1;
                if idx == 3 {
                    Err(RapportError::training("stop"))
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_err());
        assert_eq!(seen, 4);
    }

    #[test]
    fn test_write_sample_data_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let (sft, pref) = write_sample_data(dir.path()).unwrap();
        assert_eq!(SftDataset::load(sft, &ByteEncoder, 64).unwrap().len(), 3);
        assert_eq!(PreferenceDataset::load(pref, &ByteEncoder, 64).unwrap().len(), 2);
    }
}
