// Model name normalization
// Client aliases -> canonical upstream model ids

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const PRO_MODEL: &str = "gemini-2.5-pro";
pub const FLASH_MODEL: &str = "gemini-2.5-flash";
pub const FLASH_LITE_MODEL: &str = "gemini-2.5-flash-lite";

const MAX_MEMO_ENTRIES: usize = 1000;

static CANONICAL_MODELS: &[&str] = &[PRO_MODEL, FLASH_MODEL, FLASH_LITE_MODEL];

static MODEL_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();

    // Pro family
    m.insert("gemini-pro", PRO_MODEL);
    m.insert("gemini-pro-latest", PRO_MODEL);
    m.insert("gemini-1.0-pro", PRO_MODEL);
    m.insert("gemini-1.5-pro", PRO_MODEL);
    m.insert("gemini-1.5-pro-latest", PRO_MODEL);
    m.insert("gemini-2.0-pro", PRO_MODEL);
    m.insert("gemini-2.0-pro-exp", PRO_MODEL);
    m.insert("gemini-2.5-pro-latest", PRO_MODEL);
    m.insert("gemini-2.5-pro-preview", PRO_MODEL);

    // Flash family
    m.insert("gemini-flash", FLASH_MODEL);
    m.insert("gemini-flash-latest", FLASH_MODEL);
    m.insert("gemini-1.5-flash", FLASH_MODEL);
    m.insert("gemini-1.5-flash-latest", FLASH_MODEL);
    m.insert("gemini-2.0-flash", FLASH_MODEL);
    m.insert("gemini-2.0-flash-exp", FLASH_MODEL);
    m.insert("gemini-2.5-flash-latest", FLASH_MODEL);
    m.insert("gemini-2.5-flash-preview", FLASH_MODEL);

    // Flash-Lite family
    m.insert("gemini-flash-lite", FLASH_LITE_MODEL);
    m.insert("gemini-flash-lite-latest", FLASH_LITE_MODEL);
    m.insert("gemini-2.0-flash-lite", FLASH_LITE_MODEL);
    m.insert("gemini-2.5-flash-lite-preview", FLASH_LITE_MODEL);

    m
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedModel {
    pub normalized: String,
    pub changed: bool,
}

#[derive(Default)]
struct Memo {
    entries: HashMap<String, NormalizedModel>,
    order: VecDeque<String>,
}

/// Owns the override table and the memo cache
pub struct ModelNormalizer {
    overrides: HashMap<String, String>,
    memo: Mutex<Memo>,
}

impl ModelNormalizer {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self {
            overrides,
            memo: Mutex::new(Memo::default()),
        }
    }

    pub fn normalize(&self, model: &str) -> NormalizedModel {
        if let Some(hit) = self.memo_get(model) {
            return hit;
        }
        let result = self.resolve(model);
        self.memo_put(model, result.clone());
        result
    }

    fn resolve(&self, model: &str) -> NormalizedModel {
        // 1. Config overrides
        if let Some(target) = self.overrides.get(model) {
            return NormalizedModel {
                normalized: target.clone(),
                changed: target != model,
            };
        }

        // 2. Exact alias table
        if CANONICAL_MODELS.contains(&model) {
            return NormalizedModel {
                normalized: model.to_string(),
                changed: false,
            };
        }
        if let Some(canonical) = MODEL_ALIASES.get(model) {
            return NormalizedModel {
                normalized: canonical.to_string(),
                changed: true,
            };
        }

        // 3. Substring heuristics
        let lower = model.to_lowercase();
        let heuristic = if lower.contains("pro") {
            Some(PRO_MODEL)
        } else if lower.contains("flash") {
            Some(FLASH_MODEL)
        } else {
            None
        };

        match heuristic {
            Some(canonical) => {
                tracing::debug!("Model '{}' mapped heuristically to '{}'", model, canonical);
                NormalizedModel {
                    normalized: canonical.to_string(),
                    changed: canonical != model,
                }
            }
            None => NormalizedModel {
                normalized: model.to_string(),
                changed: false,
            },
        }
    }

    fn memo_get(&self, model: &str) -> Option<NormalizedModel> {
        let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.entries.get(model).cloned()
    }

    fn memo_put(&self, model: &str, result: NormalizedModel) {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        if memo.entries.insert(model.to_string(), result).is_none() {
            memo.order.push_back(model.to_string());
        }
        // FIFO eviction
        while memo.entries.len() > MAX_MEMO_ENTRIES {
            match memo.order.pop_front() {
                Some(oldest) => {
                    memo.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn memo_len(&self) -> usize {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn clear(&self) {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.entries.clear();
        memo.order.clear();
    }
}

impl Default for ModelNormalizer {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
