//! Budget compression for assembled context
//!
//! Fits the formatted context into the answering step's usable window through
//! ordered degradation: historical detail goes first, the most recent turn
//! goes last. The most recent user message survives every level.

use crate::context_engine::indexer::ChunkMatch;
use crate::memory_db::StoredMessage;
use crate::utils::TextUtils;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Usable window in token-equivalent units; a fraction of the model's
    /// true window, the rest is reserved for system prompt, documents and
    /// output.
    pub token_ceiling: usize,
    pub max_level: u8,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            token_ceiling: 200_000,
            max_level: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub compressed_content: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// compressed / original; 1.0 when nothing was cut.
    pub compression_ratio: f32,
    pub level: u8,
}

/// Per-level reduction plan. Levels are cumulative: each level keeps a subset
/// of the previous level's messages and chunks and renders each kept item at
/// most as long, so token counts never increase with the level.
struct LevelPlan {
    /// Fraction of historical chunks kept, applied to the score-descending
    /// list. None drops the layer.
    historical_kept: Option<HistoricalDetail>,
    /// Recent messages kept from the end; None keeps all.
    recent_kept: Option<usize>,
    /// Per-message content cap in chars; None leaves content uncapped.
    content_cap: Option<usize>,
}

enum HistoricalDetail {
    /// Full summaries for the top `kept_of(n)` chunks.
    Full(fn(usize) -> usize),
    /// One-line summaries for the top `kept_of(n)` chunks.
    OneLine(fn(usize) -> usize),
}

fn keep_all(n: usize) -> usize {
    n
}

fn keep_half(n: usize) -> usize {
    n.div_ceil(2)
}

// Bounded above by keep_half so each level keeps a subset of the last
fn keep_two(n: usize) -> usize {
    keep_half(n).min(2)
}

const ONE_LINE_CAP: usize = 200;

pub struct BudgetCompressor {
    config: CompressorConfig,
}

impl BudgetCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config }
    }

    pub fn needs_compression(&self, total_tokens: usize) -> bool {
        total_tokens > self.config.token_ceiling
    }

    /// Step function over how far the input overshoots the ceiling.
    pub fn determine_compression_level(&self, total_tokens: usize) -> u8 {
        let ratio = total_tokens as f64 / self.config.token_ceiling as f64;
        let level = if ratio <= 1.0 {
            0
        } else if ratio <= 1.5 {
            1
        } else if ratio <= 2.5 {
            2
        } else {
            3
        };
        level.min(self.config.max_level)
    }

    fn plan(level: u8) -> LevelPlan {
        match level {
            0 => LevelPlan {
                historical_kept: Some(HistoricalDetail::Full(keep_all)),
                recent_kept: None,
                content_cap: None,
            },
            1 => LevelPlan {
                historical_kept: Some(HistoricalDetail::Full(keep_half)),
                recent_kept: None,
                content_cap: Some(2_000),
            },
            2 => LevelPlan {
                historical_kept: Some(HistoricalDetail::OneLine(keep_two)),
                recent_kept: Some(10),
                content_cap: Some(1_000),
            },
            _ => LevelPlan {
                historical_kept: None,
                recent_kept: Some(5),
                content_cap: Some(400),
            },
        }
    }

    pub fn compress_context(
        &self,
        recent: &[StoredMessage],
        historical: &[ChunkMatch],
        level: u8,
    ) -> CompressionResult {
        let level = level.min(self.config.max_level);
        let original = self.render(recent, historical, &Self::plan(0));
        let compressed_content = if level == 0 {
            original.clone()
        } else {
            self.render(recent, historical, &Self::plan(level))
        };

        let original_tokens = TextUtils::estimate_tokens(&original);
        let compressed_tokens = TextUtils::estimate_tokens(&compressed_content);
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f32 / original_tokens as f32
        };

        debug!(
            "Compressed context at level {}: {} -> {} tokens (ratio {:.2})",
            level, original_tokens, compressed_tokens, compression_ratio
        );

        CompressionResult {
            compressed_content,
            original_tokens,
            compressed_tokens,
            compression_ratio,
            level,
        }
    }

    /// Escalate from `start_level` until the output fits the ceiling or the
    /// maximum level is reached. The maximum level caps per-message content,
    /// so the output is bounded either way.
    pub fn compress_to_fit(
        &self,
        recent: &[StoredMessage],
        historical: &[ChunkMatch],
        start_level: u8,
    ) -> CompressionResult {
        let mut level = start_level.max(1).min(self.config.max_level);
        loop {
            let result = self.compress_context(recent, historical, level);
            if result.compressed_tokens <= self.config.token_ceiling
                || level >= self.config.max_level
            {
                return result;
            }
            level += 1;
        }
    }

    fn render(
        &self,
        recent: &[StoredMessage],
        historical: &[ChunkMatch],
        plan: &LevelPlan,
    ) -> String {
        let mut out = String::new();

        let kept = Self::kept_recent(recent, plan.recent_kept);
        if !kept.is_empty() {
            out.push_str("## Recent messages\n");
            for message in kept {
                let content = match plan.content_cap {
                    Some(cap) => TextUtils::truncate_chars(&message.content, cap),
                    None => std::borrow::Cow::Borrowed(message.content.as_str()),
                };
                out.push_str(&format!("{}: {}\n", message.role, content));
            }
            out.push('\n');
        }

        if let Some(detail) = &plan.historical_kept {
            let (kept, one_line) = match detail {
                HistoricalDetail::Full(kept_of) => (kept_of(historical.len()), false),
                HistoricalDetail::OneLine(kept_of) => (kept_of(historical.len()), true),
            };
            // Matches are score-descending; keeping a prefix keeps the best
            let chunks = &historical[..kept.min(historical.len())];
            if !chunks.is_empty() {
                out.push_str("## Earlier in this conversation\n");
                for chunk in chunks {
                    if one_line {
                        out.push_str(&format!(
                            "- {}\n",
                            TextUtils::one_line(&chunk.summary, ONE_LINE_CAP)
                        ));
                    } else {
                        out.push_str(&format!("- {}\n", chunk.summary.trim()));
                    }
                }
            }
        }
        out
    }

    /// Last `keep_last` messages in chronological order, always including the
    /// most recent user message even when it falls outside the window.
    fn kept_recent(recent: &[StoredMessage], keep_last: Option<usize>) -> Vec<&StoredMessage> {
        let keep_last = match keep_last {
            Some(k) if recent.len() > k => k,
            _ => return recent.iter().collect(),
        };
        let cut = recent.len() - keep_last;
        let mut kept: Vec<&StoredMessage> = recent[cut..].iter().collect();
        if !kept.iter().any(|m| m.role == "user") {
            if let Some(user) = recent[..cut].iter().rev().find(|m| m.role == "user") {
                kept.insert(0, user);
            }
        }
        kept
    }
}
