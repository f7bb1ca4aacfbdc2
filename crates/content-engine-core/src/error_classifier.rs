//! Pure function from a [`ContentEngineError`] to an [`ErrorFingerprint`],
//! plus the degrade/retry/fatal decision consumed by the state machine.
//!
//! A closed error enum mapped deterministically onto a small number of
//! caller-visible decisions, never by downcasting strings in the caller.

use crate::error::ContentEngineError;
use crate::model::{ErrorFingerprint, ErrorKind, Manifest};

const VALIDATION_DEGRADE_CODES: &[&str] = &[
    "invalid_enum_value",
    "too_big",
    "invalid_type",
    "unrecognized_keys",
    "invalid_string",
    "invalid_literal",
];

const NO_DEGRADE_PROVIDER_MARKERS: &[&str] = &["429", "401", "403", "quota", "unauthorized"];

/// Classify an error into a stable, serialisable fingerprint. This is the
/// *only* place in the crate allowed to pattern-match on error message text.
pub fn classify(err: &ContentEngineError) -> ErrorFingerprint {
    match err {
        ContentEngineError::SchemaValidation(msg) => ErrorFingerprint {
            kind: ErrorKind::Validation,
            code: validation_code(msg),
            path: validation_path(msg),
            message: msg.clone(),
        },
        ContentEngineError::ProviderApi { code, message } => ErrorFingerprint {
            kind: ErrorKind::ProviderApi,
            code: code.to_ascii_lowercase(),
            path: None,
            message: message.clone(),
        },
        ContentEngineError::CircuitOpen { model, failures } => ErrorFingerprint {
            kind: ErrorKind::ProviderApi,
            code: "circuit_open".to_string(),
            path: None,
            message: format!("circuit open for {model} after {failures} failures"),
        },
        ContentEngineError::Network(msg) => ErrorFingerprint {
            kind: ErrorKind::Network,
            code: "network_error".to_string(),
            path: None,
            message: msg.clone(),
        },
        ContentEngineError::PoolTimeout(d) => ErrorFingerprint {
            kind: ErrorKind::ProviderApi,
            code: "pool_acquire_timeout".to_string(),
            path: None,
            message: format!("pool acquire timed out after {d:?}"),
        },
        ContentEngineError::Io(io_err) => classify_io(io_err),
        other => classify_message(&other.to_string()),
    }
}

fn classify_io(io_err: &std::io::Error) -> ErrorFingerprint {
    use std::io::ErrorKind as IoKind;
    let code = match io_err.kind() {
        IoKind::NotFound => "enoent",
        IoKind::PermissionDenied => "eacces",
        IoKind::AlreadyExists => "eexist",
        _ => "filesystem_error",
    };
    ErrorFingerprint {
        kind: ErrorKind::Filesystem,
        code: code.to_string(),
        path: None,
        message: io_err.to_string(),
    }
}

fn classify_message(message: &str) -> ErrorFingerprint {
    let lower = message.to_ascii_lowercase();
    if ["econnrefused", "etimedout", "network", "fetch"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return ErrorFingerprint {
            kind: ErrorKind::Network,
            code: "network_error".to_string(),
            path: None,
            message: message.to_string(),
        };
    }
    for code in ["enoent", "eacces", "eperm", "eexist", "enotdir"] {
        if lower.contains(code) {
            return ErrorFingerprint {
                kind: ErrorKind::Filesystem,
                code: code.to_string(),
                path: None,
                message: message.to_string(),
            };
        }
    }
    ErrorFingerprint {
        kind: ErrorKind::Unknown,
        code: "unknown".to_string(),
        path: None,
        message: message.to_string(),
    }
}

/// Schema-validation messages from `manifest_store::validate` are prefixed
/// `"<code>: ..."` by construction; fall back to a generic code otherwise.
fn validation_code(message: &str) -> String {
    message
        .split(':')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("invalid_type")
        .to_string()
}

fn validation_path(message: &str) -> Option<String> {
    let after_at = message.split(" at ").nth(1)?;
    Some(after_at.trim().to_string())
}

/// `true` iff the manifest should attempt a degraded retry with the next
/// fallback-chain model rather than bumping the plain retry counter.
pub fn should_degrade(fp: &ErrorFingerprint, manifest: &Manifest, chain_len: usize) -> bool {
    if manifest.project.meta.used_models.len() >= chain_len {
        return false;
    }
    match fp.kind {
        ErrorKind::Validation => VALIDATION_DEGRADE_CODES.contains(&fp.code.as_str()),
        ErrorKind::ProviderApi => !NO_DEGRADE_PROVIDER_MARKERS
            .iter()
            .any(|marker| fp.code.contains(marker)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_markers_classify_as_network() {
        let fp = classify(&ContentEngineError::Network("ETIMEDOUT while fetching".into()));
        assert_eq!(fp.kind, ErrorKind::Network);
        assert_eq!(fp.code, "network_error");
    }

    #[test]
    fn rate_limit_provider_errors_never_degrade() {
        let fp = ErrorFingerprint {
            kind: ErrorKind::ProviderApi,
            code: "429_too_many_requests".to_string(),
            path: None,
            message: "rate limited".to_string(),
        };
        let manifest = crate::test_support::sample_manifest();
        assert!(!should_degrade(&fp, &manifest, 3));
    }

    #[test]
    fn validation_enum_mismatch_degrades() {
        let fp = ErrorFingerprint {
            kind: ErrorKind::Validation,
            code: "invalid_enum_value".to_string(),
            path: Some("script.0.visual_hint".to_string()),
            message: "invalid_enum_value: at script.0.visual_hint".to_string(),
        };
        let manifest = crate::test_support::sample_manifest();
        assert!(should_degrade(&fp, &manifest, 3));
    }

    #[test]
    fn exhausted_chain_never_degrades() {
        let fp = ErrorFingerprint {
            kind: ErrorKind::Validation,
            code: "invalid_enum_value".to_string(),
            path: None,
            message: "invalid_enum_value".to_string(),
        };
        let mut manifest = crate::test_support::sample_manifest();
        manifest.project.meta.used_models = vec!["a".into(), "b".into(), "c".into()];
        assert!(!should_degrade(&fp, &manifest, 3));
    }
}
