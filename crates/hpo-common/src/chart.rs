//! Embedded chart archive inspection
//!
//! The chart ships as a base64 encoded `.tgz`. The operator publishes the
//! chart's `values.yaml` and `questions.yaml` into every registration
//! namespace so UIs can render a form for `spec.values`.

use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;

use crate::{Error, Result};

/// Files extracted from the chart archive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChartFiles {
    /// Content of `values.yaml`
    pub values_yaml: String,
    /// Content of `questions.yaml`
    pub questions_yaml: String,
}

impl ChartFiles {
    /// Decode the archive and pull out `values.yaml` and `questions.yaml`.
    ///
    /// Both files must exist exactly once directly below the chart's root
    /// directory (`.yml` spellings are accepted).
    pub fn from_base64_tgz(content: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(content.trim())
            .map_err(|e| Error::chart_content(format!("unable to decode base64 chart: {}", e)))?;

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let entries = archive
            .entries()
            .map_err(|e| Error::chart_content(format!("unable to read chart archive: {}", e)))?;

        let mut values: Option<String> = None;
        let mut questions: Option<String> = None;

        for entry in entries {
            let mut entry = entry
                .map_err(|e| Error::chart_content(format!("unable to read chart archive: {}", e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .map_err(|e| Error::chart_content(format!("invalid path in chart archive: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let relative = path.split_once('/').map_or(path.as_str(), |(_, rest)| rest);

            let slot = match relative {
                "values.yaml" | "values.yml" => &mut values,
                "questions.yaml" | "questions.yml" => &mut questions,
                _ => continue,
            };
            if slot.is_some() {
                return Err(Error::chart_content(format!(
                    "multiple {} files found in chart archive",
                    relative
                )));
            }
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| Error::chart_content(format!("unable to read {}: {}", path, e)))?;
            *slot = Some(content);
        }

        let values_yaml =
            values.ok_or_else(|| Error::chart_content("values.yaml was not found in the chart"))?;
        let questions_yaml = questions
            .ok_or_else(|| Error::chart_content("questions.yaml was not found in the chart"))?;
        Ok(Self {
            values_yaml,
            questions_yaml,
        })
    }
}
