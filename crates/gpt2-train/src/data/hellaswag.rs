//! HellaSwag multiple-choice examples.
//!
//! Each JSONL line carries a context, candidate endings and the index of the
//! correct ending. Rendering produces one token row per candidate: the
//! context followed by `" " + ending`, with a mask that is 0 over the context
//! and 1 over the ending, zero-padded to the longest row.

use std::io::BufRead;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::Deserialize;

use super::tokenizer::TextCodec;
use crate::error::{IoResultExt, TrainError, TrainResult};

/// One benchmark item as stored on disk. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct HellaSwagExample {
    pub ctx: String,
    pub endings: Vec<String>,
    pub label: usize,
}

/// Candidate rows for one example, ready for scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedExample {
    /// `(num_candidates, width)` token IDs, zero-padded.
    pub tokens: Vec<Vec<u32>>,
    /// Same shape; 1 where the token belongs to the candidate ending.
    pub mask: Vec<Vec<u8>>,
    pub label: usize,
}

impl RenderedExample {
    pub fn num_candidates(&self) -> usize {
        self.tokens.len()
    }

    pub fn width(&self) -> usize {
        self.tokens.first().map_or(0, Vec::len)
    }

    /// `(tokens u32, mask f32)` tensors of shape `(num_candidates, width)`.
    pub fn to_tensors(&self, device: &Device) -> TrainResult<(Tensor, Tensor)> {
        let shape = (self.num_candidates(), self.width());
        let tokens: Vec<u32> = self.tokens.iter().flatten().copied().collect();
        let mask: Vec<f32> = self.mask.iter().flatten().map(|&m| m as f32).collect();
        Ok((
            Tensor::from_vec(tokens, shape, device)?,
            Tensor::from_vec(mask, shape, device)?,
        ))
    }
}

/// Read every example from a JSONL file.
pub fn load_examples(path: &Path) -> TrainResult<Vec<HellaSwagExample>> {
    let file = std::fs::File::open(path).with_path(path)?;
    let mut examples = Vec::new();
    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_path(path)?;
        if line.trim().is_empty() {
            continue;
        }
        let example: HellaSwagExample = serde_json::from_str(&line).map_err(|e| {
            TrainError::DataAvailability(format!(
                "{}:{}: malformed example: {}",
                path.display(),
                lineno + 1,
                e
            ))
        })?;
        examples.push(example);
    }
    tracing::info!(path = %path.display(), count = examples.len(), "Loaded HellaSwag examples");
    Ok(examples)
}

/// Tokenize an example into padded candidate rows.
pub fn render_example(
    example: &HellaSwagExample,
    codec: &dyn TextCodec,
) -> TrainResult<RenderedExample> {
    if example.endings.is_empty() {
        return Err(TrainError::DataAvailability(
            "example has no endings".to_string(),
        ));
    }
    if example.label >= example.endings.len() {
        return Err(TrainError::DataAvailability(format!(
            "label {} out of range for {} endings",
            example.label,
            example.endings.len()
        )));
    }

    let ctx_tokens = codec.encode(&example.ctx)?;
    let mut rows = Vec::with_capacity(example.endings.len());
    let mut masks = Vec::with_capacity(example.endings.len());
    for ending in &example.endings {
        // the leading space keeps GPT-2 word-boundary tokens intact
        let end_tokens = codec.encode(&format!(" {}", ending))?;
        let mut row = ctx_tokens.clone();
        row.extend_from_slice(&end_tokens);
        let mut mask = vec![0u8; ctx_tokens.len()];
        mask.extend(std::iter::repeat(1u8).take(end_tokens.len()));
        rows.push(row);
        masks.push(mask);
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for (row, mask) in rows.iter_mut().zip(masks.iter_mut()) {
        row.resize(width, 0);
        mask.resize(width, 0);
    }

    Ok(RenderedExample {
        tokens: rows,
        mask: masks,
        label: example.label,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One token per byte.
    pub(crate) struct ByteCodec;

    impl TextCodec for ByteCodec {
        fn encode(&self, text: &str) -> TrainResult<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, ids: &[u32]) -> TrainResult<String> {
            Ok(ids.iter().map(|&b| b as u8 as char).collect())
        }
    }

    fn example() -> HellaSwagExample {
        HellaSwagExample {
            ctx: "ab".to_string(),
            endings: vec!["c".to_string(), "def".to_string()],
            label: 1,
        }
    }

    #[test]
    fn test_render_masks_endings_and_pads() -> TrainResult<()> {
        let r = render_example(&example(), &ByteCodec)?;
        assert_eq!(r.num_candidates(), 2);
        assert_eq!(r.width(), 6);
        assert_eq!(r.tokens[0], vec![97, 98, 32, 99, 0, 0]);
        assert_eq!(r.mask[0], vec![0, 0, 1, 1, 0, 0]);
        assert_eq!(r.tokens[1], vec![97, 98, 32, 100, 101, 102]);
        assert_eq!(r.mask[1], vec![0, 0, 1, 1, 1, 1]);
        assert_eq!(r.label, 1);
        Ok(())
    }

    #[test]
    fn test_render_rejects_bad_label() {
        let mut ex = example();
        ex.label = 5;
        assert!(matches!(
            render_example(&ex, &ByteCodec),
            Err(TrainError::DataAvailability(_))
        ));
    }

    #[test]
    fn test_tensors_shape() -> TrainResult<()> {
        let r = render_example(&example(), &ByteCodec)?;
        let (tokens, mask) = r.to_tensors(&Device::Cpu)?;
        assert_eq!(tokens.dims(), &[2, 6]);
        assert_eq!(mask.sum_all()?.to_scalar::<f32>()?, 6.0);
        Ok(())
    }

    #[test]
    fn test_load_jsonl_ignores_extra_fields() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hellaswag_val.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"ind": 24, "ctx": "A man", "endings": ["a", "b", "c", "d"], "label": 3, "split": "val"}"#,
                "\n\n",
                r#"{"ctx": "B", "endings": ["x", "y"], "label": 0}"#,
                "\n"
            ),
        )
        .unwrap();
        let examples = load_examples(&path)?;
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].label, 3);
        assert_eq!(examples[1].endings, vec!["x", "y"]);
        Ok(())
    }

    #[test]
    fn test_malformed_line_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"ctx\": 1}\n").unwrap();
        let err = load_examples(&path).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
