use crate::{asset_fetcher::resolve_location, subsystems::RetryPolicy, subsystems::Subsystem};
use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_valid::Validate;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_ROOT_PATH: &str = "./";
const DEFAULT_FACE_MODEL: &str = "models/face/face-model.bin";
const DEFAULT_SEGMENTATION_MODEL: &str = "models/segmentation/segmentation-160x160.bin";
const DEFAULT_FOOT_MODEL: &str = "models/foot/foot-tracking.bin";

/// Eager bring-up requests applied at session start
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Hint {
    FaceModelsPredownload,
    SegmentationModelsPredownload,
    FootModelsPredownload,
    SegmentationInit,
    FootInit,
}

impl FromStr for Hint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_camel_case(s, "hint")
    }
}

impl FromStr for RetryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_camel_case(s, "retry policy")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub model_path: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalOptions {
    #[serde(default, deserialize_with = "one_or_many")]
    pub hint: Vec<Hint>,
    #[serde(default)]
    pub face_tracking_config: ModelConfig,
    #[serde(default)]
    pub segmentation_config: ModelConfig,
    #[serde(default)]
    pub foot_tracking_config: ModelConfig,
}

/// Session initialization parameters
///
/// Mirrors the shape of the JavaScript init object, so it can be parsed from
/// JSON handed over by the host page, or assembled from `AR_*` environment
/// variables.
#[derive(Clone, Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[validate(min_length = 1)]
    pub license_key: String,

    /// Rendering target forwarded to the engine
    #[serde(default)]
    pub canvas: Option<String>,

    /// Effect loaded into the default slot once the session is up
    #[serde(default)]
    pub effect: Option<String>,

    /// Base URL or path for lazily fetched model assets
    #[serde(default = "default_root_path")]
    #[validate(min_length = 1)]
    pub root_path: String,

    #[serde(default)]
    pub additional_options: AdditionalOptions,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
}

impl SessionConfig {
    pub fn new(license_key: impl Into<String>) -> Self {
        Self {
            license_key: license_key.into(),
            canvas: None,
            effect: None,
            root_path: default_root_path(),
            additional_options: AdditionalOptions::default(),
            retry_policy: RetryPolicy::default(),
            fetch_timeout_ms: None,
        }
    }

    /// Load and validate the configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Parse and validate the JSON init object
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("failed to parse session configuration")?;
        config.ensure_valid()?;
        Ok(config)
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let license_key = var("AR_LICENSE_KEY").context("failed to get AR_LICENSE_KEY")?;

        let hint = var("AR_HINTS")
            .map(|hints| {
                hints
                    .split(',')
                    .filter(|h| !h.trim().is_empty())
                    .map(str::parse)
                    .collect::<Result<Vec<Hint>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let retry_policy = var("AR_RETRY_POLICY")
            .map(|policy| policy.parse::<RetryPolicy>())
            .transpose()?
            .unwrap_or_default();

        let fetch_timeout_ms = var("AR_FETCH_TIMEOUT_MS")
            .map(|ms| {
                ms.parse::<u64>()
                    .context("failed to parse AR_FETCH_TIMEOUT_MS: invalid format")
            })
            .transpose()?;

        let model_config = |key: &str| ModelConfig {
            model_path: var(key),
        };

        let config = Self {
            license_key,
            canvas: var("AR_CANVAS"),
            effect: var("AR_EFFECT"),
            root_path: var("AR_ROOT_PATH").unwrap_or_else(default_root_path),
            additional_options: AdditionalOptions {
                hint,
                face_tracking_config: model_config("AR_FACE_MODEL_PATH"),
                segmentation_config: model_config("AR_SEGMENTATION_MODEL_PATH"),
                foot_tracking_config: model_config("AR_FOOT_MODEL_PATH"),
            },
            retry_policy,
            fetch_timeout_ms,
        };

        config.ensure_valid()?;
        Ok(config)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|e| anyhow!("invalid session configuration: {e}"))?;
        ensure!(
            self.fetch_timeout_ms != Some(0),
            "invalid session configuration: fetchTimeoutMs must be positive"
        );
        Ok(())
    }

    pub fn hints(&self) -> &[Hint] {
        &self.additional_options.hint
    }

    pub fn has_hint(&self, hint: Hint) -> bool {
        self.hints().contains(&hint)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn face_model_location(&self) -> String {
        let path = self
            .additional_options
            .face_tracking_config
            .model_path
            .as_deref()
            .unwrap_or(DEFAULT_FACE_MODEL);
        resolve_location(&self.root_path, path)
    }

    pub fn subsystem_model_location(&self, kind: Subsystem) -> String {
        let (config, default) = match kind {
            Subsystem::Segmentation => (
                &self.additional_options.segmentation_config,
                DEFAULT_SEGMENTATION_MODEL,
            ),
            Subsystem::FootTracking => {
                (&self.additional_options.foot_tracking_config, DEFAULT_FOOT_MODEL)
            }
        };
        resolve_location(&self.root_path, config.model_path.as_deref().unwrap_or(default))
    }
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

fn parse_camel_case<T: DeserializeOwned>(value: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_string()))
        .with_context(|| format!("failed to parse {what}: unknown value '{}'", value.trim()))
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<Hint>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Hint),
        Many(Vec<Hint>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(hint) => vec![hint],
        OneOrMany::Many(hints) => hints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    mod json {
        use super::*;

        #[test]
        fn parses_init_object() {
            let config = SessionConfig::from_json(
                r#"{
                    "licenseKey": "abc",
                    "canvas": "ar-canvas",
                    "effect": "effects/viking.deepar",
                    "rootPath": "https://cdn.example.com/ar",
                    "additionalOptions": {
                        "hint": ["segmentationInit", "footModelsPredownload"],
                        "segmentationConfig": { "modelPath": "custom/seg.bin" }
                    }
                }"#,
            )
            .unwrap();

            assert_eq!(config.license_key, "abc");
            assert_eq!(config.canvas.as_deref(), Some("ar-canvas"));
            assert_eq!(config.effect.as_deref(), Some("effects/viking.deepar"));
            assert_eq!(
                config.hints(),
                &[Hint::SegmentationInit, Hint::FootModelsPredownload]
            );
            assert_eq!(
                config.subsystem_model_location(Subsystem::Segmentation),
                "https://cdn.example.com/ar/custom/seg.bin"
            );
            assert_eq!(
                config.subsystem_model_location(Subsystem::FootTracking),
                "https://cdn.example.com/ar/models/foot/foot-tracking.bin"
            );
            assert_eq!(config.retry_policy, RetryPolicy::ExplicitReset);
            assert_eq!(config.fetch_timeout(), None);
        }

        #[test]
        fn accepts_single_hint() {
            let config = SessionConfig::from_json(
                r#"{ "licenseKey": "abc", "additionalOptions": { "hint": "footInit" } }"#,
            )
            .unwrap();

            assert_eq!(config.hints(), &[Hint::FootInit]);
            assert_eq!(config.root_path, "./");
        }

        #[test]
        fn rejects_unknown_hint() {
            let result = SessionConfig::from_json(
                r#"{ "licenseKey": "abc", "additionalOptions": { "hint": ["warpDrive"] } }"#,
            );

            assert!(result.is_err());
        }

        #[test]
        fn rejects_empty_license_key() {
            let result = SessionConfig::from_json(r#"{ "licenseKey": "" }"#);

            let error = format!("{:#}", result.unwrap_err());
            assert!(error.contains("invalid session configuration"), "{error}");
        }

        #[test]
        fn rejects_zero_timeout() {
            let result = SessionConfig::from_json(r#"{ "licenseKey": "abc", "fetchTimeoutMs": 0 }"#);

            assert!(result.is_err());
        }
    }

    mod environment {
        use super::*;

        #[test]
        fn requires_license_key() {
            let result = SessionConfig::from_vars(vars(&[]));

            let error = format!("{:#}", result.unwrap_err());
            assert!(error.contains("AR_LICENSE_KEY"), "{error}");
        }

        #[test]
        fn applies_defaults() {
            let config = SessionConfig::from_vars(vars(&[("AR_LICENSE_KEY", "abc")])).unwrap();

            assert!(config.hints().is_empty());
            assert_eq!(config.canvas, None);
            assert_eq!(config.face_model_location(), "./models/face/face-model.bin");
            assert_eq!(config.retry_policy, RetryPolicy::ExplicitReset);
        }

        #[test]
        fn parses_all_variables() {
            let config = SessionConfig::from_vars(vars(&[
                ("AR_LICENSE_KEY", "abc"),
                ("AR_CANVAS", "main"),
                ("AR_EFFECT", "effects/aviators.deepar"),
                ("AR_ROOT_PATH", "/opt/ar/"),
                ("AR_HINTS", "faceModelsPredownload, segmentationInit,"),
                ("AR_FACE_MODEL_PATH", "face/custom.bin"),
                ("AR_FOOT_MODEL_PATH", "https://cdn.example.com/foot.bin"),
                ("AR_RETRY_POLICY", "onNextCall"),
                ("AR_FETCH_TIMEOUT_MS", "2500"),
            ]))
            .unwrap();

            assert_eq!(config.canvas.as_deref(), Some("main"));
            assert_eq!(config.effect.as_deref(), Some("effects/aviators.deepar"));
            assert!(config.has_hint(Hint::FaceModelsPredownload));
            assert!(config.has_hint(Hint::SegmentationInit));
            assert!(!config.has_hint(Hint::FootInit));
            assert_eq!(config.face_model_location(), "/opt/ar/face/custom.bin");
            assert_eq!(
                config.subsystem_model_location(Subsystem::FootTracking),
                "https://cdn.example.com/foot.bin"
            );
            assert_eq!(config.retry_policy, RetryPolicy::OnNextCall);
            assert_eq!(config.fetch_timeout(), Some(Duration::from_millis(2500)));
        }

        #[test]
        fn rejects_invalid_timeout_format() {
            let result = SessionConfig::from_vars(vars(&[
                ("AR_LICENSE_KEY", "abc"),
                ("AR_FETCH_TIMEOUT_MS", "soon"),
            ]));

            let error = format!("{:#}", result.unwrap_err());
            assert!(error.contains("AR_FETCH_TIMEOUT_MS"), "{error}");
        }

        #[test]
        fn rejects_unknown_retry_policy() {
            let result = SessionConfig::from_vars(vars(&[
                ("AR_LICENSE_KEY", "abc"),
                ("AR_RETRY_POLICY", "sometimes"),
            ]));

            assert!(result.is_err());
        }
    }
}
