//! Neuron addressing
//!
//! A [`NeuronTarget`] names one MLP unit at one token position of one layer.
//! Targets come either from explicit JSON (`{"layer": 2, "neuron": 10263}`) or
//! from neuron-path strings of the form `"<model>_<layer>_<neuron>_<token>"`,
//! e.g. `"meta-llama/Meta-Llama-3.1-8B-Instruct_2_10263_None"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Token position a neuron edit applies to.
///
/// Positions are resolved against the chunk of tokens flowing through a
/// forward call, described by `start_pos` (tokens already in the KV cache) and
/// `seq_len` (tokens in this call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPosition {
    /// Absolute position in the full sequence
    Index(usize),
    /// Counted back from the end of the current chunk (0 = last token)
    FromEnd(usize),
    /// Every position
    All,
}

impl TokenPosition {
    /// The last token of the current chunk
    pub const LAST: TokenPosition = TokenPosition::FromEnd(0);

    /// Resolve to chunk-local indices.
    ///
    /// For a full pass (`start_pos == 0`) a position that falls outside the
    /// sequence is an error. During incremental decoding (`start_pos > 0`)
    /// absolute positions outside the chunk simply do not apply.
    pub fn resolve(&self, start_pos: usize, seq_len: usize) -> Result<Vec<usize>> {
        match *self {
            TokenPosition::All => Ok((0..seq_len).collect()),
            TokenPosition::FromEnd(k) => {
                if k < seq_len {
                    Ok(vec![seq_len - 1 - k])
                } else if start_pos == 0 {
                    bail!("Token offset -{} out of range (sequence has {seq_len} tokens)", k + 1)
                } else {
                    Ok(vec![])
                }
            }
            TokenPosition::Index(i) => {
                if i >= start_pos && i < start_pos + seq_len {
                    Ok(vec![i - start_pos])
                } else if start_pos == 0 {
                    bail!("Token position {i} out of range (sequence has {seq_len} tokens)")
                } else {
                    Ok(vec![])
                }
            }
        }
    }

    /// Sort rank: the signed integer of the neuron path (`-2 < -1 < 0 < 1`),
    /// with `All` after every concrete position.
    fn rank(&self) -> (u8, i128) {
        match *self {
            TokenPosition::FromEnd(k) => (0, -(k as i128) - 1),
            TokenPosition::Index(i) => (0, i as i128),
            TokenPosition::All => (1, 0),
        }
    }
}

impl Default for TokenPosition {
    fn default() -> Self {
        Self::LAST
    }
}

impl PartialOrd for TokenPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TokenPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for TokenPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenPosition::Index(i) => write!(f, "{i}"),
            TokenPosition::FromEnd(k) => write!(f, "-{}", k + 1),
            TokenPosition::All => write!(f, "all"),
        }
    }
}

impl FromStr for TokenPosition {
    type Err = anyhow::Error;

    /// Accepts `None`/`last` (last token), `all`, a non-negative index, or a
    /// negative Python-style offset (`-1` is the last token).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "none" | "last" => return Ok(Self::LAST),
            "all" | "*" => return Ok(Self::All),
            _ => {}
        }
        let value: i64 = s
            .parse()
            .with_context(|| format!("Invalid token position: {s:?}"))?;
        if value >= 0 {
            Ok(Self::Index(value as usize))
        } else {
            Ok(Self::FromEnd((value.unsigned_abs() - 1) as usize))
        }
    }
}

/// One MLP unit at one token position of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeuronTarget {
    pub layer: usize,
    pub neuron: usize,
    #[serde(default)]
    pub token: TokenPosition,
}

impl NeuronTarget {
    /// Target the last token of the sequence.
    pub fn new(layer: usize, neuron: usize) -> Self {
        Self {
            layer,
            neuron,
            token: TokenPosition::LAST,
        }
    }

    pub fn at(mut self, token: TokenPosition) -> Self {
        self.token = token;
        self
    }

    /// Parse a neuron path. The last three `_`-separated fields are the layer,
    /// the neuron index and the token position; everything before them is the
    /// model name and may itself contain underscores.
    pub fn parse_path(path: &str) -> Result<Self> {
        let fields: Vec<&str> = path.trim().rsplitn(4, '_').collect();
        if fields.len() < 3 {
            bail!("Neuron path {path:?} must end in _<layer>_<neuron>_<token>");
        }
        // rsplitn yields fields back to front
        let token: TokenPosition = fields[0].parse()?;
        let neuron: usize = fields[1]
            .parse()
            .with_context(|| format!("Invalid neuron index in {path:?}"))?;
        let layer: usize = fields[2]
            .parse()
            .with_context(|| format!("Invalid layer index in {path:?}"))?;
        Ok(Self {
            layer,
            neuron,
            token,
        })
    }

    /// Grouping key used in activation statistics: `"layer/neuron"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.layer, self.neuron)
    }

    /// Sort key: layer, then token, then neuron.
    pub fn sort_key(&self) -> (usize, TokenPosition, usize) {
        (self.layer, self.token, self.neuron)
    }
}

impl fmt::Display for NeuronTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}:N{}@{}", self.layer, self.neuron, self.token)
    }
}

impl FromStr for NeuronTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_path(s)
    }
}

/// Sort targets by `(layer, token, neuron)` in place.
pub fn sort_targets(targets: &mut [NeuronTarget]) {
    targets.sort_by_key(NeuronTarget::sort_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_with_model_prefix() {
        let t = NeuronTarget::parse_path("meta-llama/Meta-Llama-3.1-8B-Instruct_2_10263_None")
            .unwrap();
        assert_eq!(t.layer, 2);
        assert_eq!(t.neuron, 10263);
        assert_eq!(t.token, TokenPosition::LAST);
    }

    #[test]
    fn test_parse_path_underscores_in_model_name() {
        let t = NeuronTarget::parse_path("my_model_name_7_42_3").unwrap();
        assert_eq!((t.layer, t.neuron), (7, 42));
        assert_eq!(t.token, TokenPosition::Index(3));
    }

    #[test]
    fn test_parse_path_without_model() {
        let t: NeuronTarget = "0_5_-2".parse().unwrap();
        assert_eq!(t.layer, 0);
        assert_eq!(t.neuron, 5);
        assert_eq!(t.token, TokenPosition::FromEnd(1));
    }

    #[test]
    fn test_parse_path_rejects_garbage() {
        assert!(NeuronTarget::parse_path("model_x_5_None").is_err());
        assert!(NeuronTarget::parse_path("5_None").is_err());
        assert!(NeuronTarget::parse_path("model_1_2_maybe").is_err());
    }

    #[test]
    fn test_key() {
        assert_eq!(NeuronTarget::new(3, 17).key(), "3/17");
    }

    #[test]
    fn test_sort_layer_then_token_then_neuron() {
        let mut targets = vec![
            NeuronTarget::new(2, 5),
            NeuronTarget::new(1, 9),
            NeuronTarget::new(1, 3).at(TokenPosition::Index(4)),
            NeuronTarget::new(1, 1),
            NeuronTarget::new(1, 2).at(TokenPosition::Index(0)),
        ];
        sort_targets(&mut targets);
        let order: Vec<(usize, usize)> = targets.iter().map(|t| (t.layer, t.neuron)).collect();
        assert_eq!(order, vec![(1, 1), (1, 9), (1, 2), (1, 3), (2, 5)]);
    }

    #[test]
    fn test_token_order_is_numeric() {
        let mut tokens = vec![
            TokenPosition::All,
            TokenPosition::Index(2),
            TokenPosition::LAST,
            TokenPosition::Index(0),
            TokenPosition::FromEnd(1),
        ];
        tokens.sort();
        assert_eq!(
            tokens,
            vec![
                TokenPosition::FromEnd(1),
                TokenPosition::LAST,
                TokenPosition::Index(0),
                TokenPosition::Index(2),
                TokenPosition::All,
            ]
        );
    }

    #[test]
    fn test_resolve_full_pass() {
        assert_eq!(TokenPosition::LAST.resolve(0, 5).unwrap(), vec![4]);
        assert_eq!(TokenPosition::FromEnd(2).resolve(0, 5).unwrap(), vec![2]);
        assert_eq!(TokenPosition::Index(1).resolve(0, 5).unwrap(), vec![1]);
        assert_eq!(TokenPosition::All.resolve(0, 3).unwrap(), vec![0, 1, 2]);
        assert!(TokenPosition::Index(5).resolve(0, 5).is_err());
        assert!(TokenPosition::FromEnd(5).resolve(0, 5).is_err());
    }

    #[test]
    fn test_resolve_decode_step() {
        // One new token at absolute position 7
        assert_eq!(TokenPosition::LAST.resolve(7, 1).unwrap(), vec![0]);
        assert_eq!(TokenPosition::Index(7).resolve(7, 1).unwrap(), vec![0]);
        assert!(TokenPosition::Index(2).resolve(7, 1).unwrap().is_empty());
        assert!(TokenPosition::FromEnd(3).resolve(7, 1).unwrap().is_empty());
    }

    #[test]
    fn test_token_position_from_str() {
        assert_eq!("None".parse::<TokenPosition>().unwrap(), TokenPosition::LAST);
        assert_eq!("-1".parse::<TokenPosition>().unwrap(), TokenPosition::LAST);
        assert_eq!("all".parse::<TokenPosition>().unwrap(), TokenPosition::All);
        assert_eq!("12".parse::<TokenPosition>().unwrap(), TokenPosition::Index(12));
        assert_eq!(
            "-9223372036854775808".parse::<TokenPosition>().unwrap(),
            TokenPosition::FromEnd(i64::MAX as usize)
        );
        assert!("-9223372036854775809".parse::<TokenPosition>().is_err());
    }

    #[test]
    fn test_target_json_defaults_to_last_token() {
        let t: NeuronTarget = serde_json::from_str(r#"{"layer": 4, "neuron": 8}"#).unwrap();
        assert_eq!(t, NeuronTarget::new(4, 8));
        let t: NeuronTarget =
            serde_json::from_str(r#"{"layer": 4, "neuron": 8, "token": {"index": 2}}"#).unwrap();
        assert_eq!(t.token, TokenPosition::Index(2));
    }
}
