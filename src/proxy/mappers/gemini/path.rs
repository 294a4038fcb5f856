// Inbound path parsing: `v1(beta)?/models/<model>:<action>`

use once_cell::sync::Lazy;
use regex::Regex;

static MODEL_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/?(v1(?:beta)?)/models/([^/:?]+):([^/:?]+)$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPath {
    /// `v1` or `v1beta`
    pub version: String,
    pub model: String,
    pub action: String,
}

pub fn parse_model_path(path: &str) -> Option<ModelPath> {
    let caps = MODEL_PATH_RE.captures(path)?;
    Some(ModelPath {
        version: caps[1].to_string(),
        model: caps[2].to_string(),
        action: caps[3].to_string(),
    })
}
