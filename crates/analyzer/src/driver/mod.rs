#![forbid(unsafe_code)]

//! Running an introspection routine inside an attached target.

pub mod python;

pub use python::PythonDriver;

use crate::error::ExecutionError;
use crate::session::AttachSession;
use crate::snapshot::TypeStats;
use async_trait::async_trait;
use config::Introspection;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Shape the routine's return value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputSchema {
    /// `{"types": {name: {"count", "total_bytes"}}, "samples": {name: [str]}}`
    #[default]
    TypeBreakdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntrospectionRequest {
    /// Source of the routine. It must define `collect(params)`.
    pub routine: String,
    pub params: serde_json::Value,
    pub schema: OutputSchema,
}

impl IntrospectionRequest {
    /// The built-in heap census: every object the collector tracks plus
    /// their direct referents, grouped by type.
    pub fn object_census(sample_limit: u32, sample_max_len: u32) -> Self {
        Self {
            routine: python::OBJECT_CENSUS.to_owned(),
            params: serde_json::json!({
                "sample_limit": sample_limit,
                "sample_max_len": sample_max_len,
            }),
            schema: OutputSchema::TypeBreakdown,
        }
    }

    pub fn from_config(config: &Introspection) -> Self {
        Self::object_census(config.sample_limit, config.sample_max_len)
    }
}

/// Validated routine result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructuredOutput {
    pub types: BTreeMap<String, TypeStats>,
    pub samples: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    error: Option<String>,
    /// Set by the bootstrap when the return value could not be encoded.
    #[serde(default)]
    malformed: Option<String>,
    #[serde(default)]
    types: Option<BTreeMap<String, RawStats>>,
    #[serde(default)]
    samples: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStats {
    count: u64,
    total_bytes: u64,
}

impl StructuredOutput {
    /// Parse and validate what a routine produced.
    ///
    /// A routine that raised reports `{"error": ...}`; that surfaces as
    /// [`ExecutionError::InjectionFailed`]. Anything else that does not match
    /// `schema` is [`ExecutionError::MalformedOutput`].
    pub fn parse(raw: &str, schema: OutputSchema) -> Result<Self, ExecutionError> {
        let OutputSchema::TypeBreakdown = schema;
        let raw: RawOutput =
            serde_json::from_str(raw).map_err(|err| ExecutionError::MalformedOutput {
                reason: err.to_string(),
            })?;
        if let Some(error) = raw.error {
            return Err(ExecutionError::InjectionFailed {
                cause: error.trim_end().to_owned(),
            });
        }
        if let Some(reason) = raw.malformed {
            return Err(ExecutionError::MalformedOutput { reason });
        }
        let types = raw.types.ok_or_else(|| ExecutionError::MalformedOutput {
            reason: "missing `types`".to_owned(),
        })?;
        if let Some(name) = types.keys().find(|name| name.is_empty()) {
            return Err(ExecutionError::MalformedOutput {
                reason: format!("empty type name {name:?}"),
            });
        }
        Ok(Self {
            types: types
                .into_iter()
                .map(|(name, stats)| {
                    let stats = TypeStats {
                        count: stats.count,
                        total_bytes: stats.total_bytes,
                    };
                    (name, stats)
                })
                .collect(),
            samples: raw.samples,
        })
    }

    pub fn object_count(&self) -> u64 {
        self.types.values().map(|stats| stats.count).sum()
    }
}

#[async_trait]
pub trait IntrospectionDriver: Send + Sync {
    /// Run `request` inside the session's target.
    ///
    /// Moves the session `Attached -> Executing` and back. On failure the
    /// session is left in whatever state the failure implies; the caller
    /// still owns cleanup.
    async fn execute(
        &self,
        session: &mut AttachSession,
        request: &IntrospectionRequest,
        timeout: Duration,
    ) -> Result<StructuredOutput, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_output_parses() {
        let out = StructuredOutput::parse(
            r#"{"types": {"dict": {"count": 3, "total_bytes": 700}, "str": {"count": 2, "total_bytes": 100}},
                "samples": {"str": ["a", "bb"]}}"#,
            OutputSchema::TypeBreakdown,
        )
        .unwrap();
        assert_eq!(out.object_count(), 5);
        assert_eq!(
            out.types["dict"],
            TypeStats {
                count: 3,
                total_bytes: 700
            }
        );
        assert_eq!(out.samples["str"], ["a", "bb"]);
    }

    #[test]
    fn samples_are_optional() {
        let out = StructuredOutput::parse(r#"{"types": {}}"#, OutputSchema::TypeBreakdown).unwrap();
        assert!(out.types.is_empty());
        assert!(out.samples.is_empty());
    }

    #[test]
    fn routine_error_is_an_injection_failure() {
        let err = StructuredOutput::parse(
            r#"{"error": "Traceback...\nNameError: x\n"}"#,
            OutputSchema::TypeBreakdown,
        )
        .unwrap_err();
        match err {
            ExecutionError::InjectionFailed { cause } => assert!(cause.ends_with("NameError: x")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn schema_violations_are_malformed() {
        for raw in [
            "",
            "not json",
            "[]",
            r#"{"samples": {}}"#,
            r#"{"types": {"dict": {"count": -1, "total_bytes": 0}}}"#,
            r#"{"types": {"dict": {"count": 1}}}"#,
            r#"{"types": {"dict": {"count": 1, "total_bytes": 2, "extra": 3}}}"#,
            r#"{"types": {"": {"count": 1, "total_bytes": 2}}}"#,
            r#"{"types": {}, "samples": {"str": [1]}}"#,
        ] {
            let result = StructuredOutput::parse(raw, OutputSchema::TypeBreakdown);
            assert!(
                matches!(result, Err(ExecutionError::MalformedOutput { .. })),
                "{raw:?} gave {result:?}"
            );
        }
    }

    #[test]
    fn unencodable_result_is_malformed() {
        let err = StructuredOutput::parse(
            r#"{"malformed": "result is not JSON: TypeError('set')"}"#,
            OutputSchema::TypeBreakdown,
        )
        .unwrap_err();
        match err {
            ExecutionError::MalformedOutput { reason } => assert!(reason.contains("TypeError")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn census_request_carries_limits() {
        let request = IntrospectionRequest::object_census(5, 80);
        assert_eq!(request.params["sample_limit"], 5);
        assert_eq!(request.params["sample_max_len"], 80);
        assert!(request.routine.contains("def collect(params)"));
    }
}
