//! Biometric templates: unit-normalized face vectors and their text encodings.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TemplateError {
    #[error("template has no values")]
    Empty,
    #[error("template contains a non-finite value")]
    NonFinite,
    #[error("template has zero norm")]
    ZeroNorm,
    #[error("malformed template value: {0}")]
    Malformed(String),
    #[error("unrecognized template encoding (expected `[..]` or `{{..}}`)")]
    UnknownEncoding,
}

/// An L2-normalized face embedding.
///
/// Because every template is unit length, the dot product of two templates
/// is their cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct BiometricTemplate {
    values: Vec<f32>,
}

impl BiometricTemplate {
    /// Normalize a raw embedding into a template.
    ///
    /// Rejects empty, non-finite and zero vectors: such a template could
    /// never produce a meaningful similarity.
    pub fn from_raw(raw: Vec<f32>) -> Result<Self, TemplateError> {
        if raw.is_empty() {
            return Err(TemplateError::Empty);
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(TemplateError::NonFinite);
        }

        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= 0.0 {
            return Err(TemplateError::ZeroNorm);
        }

        Ok(Self {
            values: raw.into_iter().map(|v| v / norm).collect(),
        })
    }

    /// Parse a stored template.
    ///
    /// Accepts a JSON array (`[0.1, 0.2]`) or a Postgres array literal
    /// (`{0.1,0.2}`), the two forms the person database has held.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let text = text.trim();

        let raw = if text.starts_with('[') {
            serde_json::from_str::<Vec<f32>>(text)
                .map_err(|e| TemplateError::Malformed(e.to_string()))?
        } else if let Some(inner) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
            let inner = inner.trim();
            if inner.is_empty() {
                return Err(TemplateError::Empty);
            }
            inner
                .split(',')
                .map(|part| {
                    let part = part.trim();
                    part.parse::<f32>()
                        .map_err(|_| TemplateError::Malformed(part.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            return Err(TemplateError::UnknownEncoding);
        };

        Self::from_raw(raw)
    }

    /// Render as a Postgres array literal, e.g. `{0.6,0.8}`.
    pub fn to_pg_array(&self) -> String {
        let joined = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{joined}}}")
    }

    /// Cosine similarity against another template.
    ///
    /// Returns `None` when the dimensions differ. Always walks every
    /// dimension.
    pub fn similarity(&self, other: &BiometricTemplate) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| a * b)
                .sum(),
        )
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_normalizes() {
        let t = BiometricTemplate::from_raw(vec![3.0, 4.0]).unwrap();
        assert!((t.values()[0] - 0.6).abs() < 1e-6);
        assert!((t.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_from_raw_rejects_degenerate() {
        assert_eq!(BiometricTemplate::from_raw(vec![]), Err(TemplateError::Empty));
        assert_eq!(
            BiometricTemplate::from_raw(vec![0.0, 0.0]),
            Err(TemplateError::ZeroNorm)
        );
        assert_eq!(
            BiometricTemplate::from_raw(vec![1.0, f32::NAN]),
            Err(TemplateError::NonFinite)
        );
    }

    #[test]
    fn test_parse_json_array() {
        let t = BiometricTemplate::parse(" [1.0, 0.0, 0.0] ").unwrap();
        assert_eq!(t.dim(), 3);
        assert!((t.values()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_pg_array() {
        let t = BiometricTemplate::parse("{0, 2.0,0}").unwrap();
        assert_eq!(t.values(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(BiometricTemplate::parse("{}"), Err(TemplateError::Empty));
        assert_eq!(
            BiometricTemplate::parse("0.1,0.2"),
            Err(TemplateError::UnknownEncoding)
        );
        assert!(matches!(
            BiometricTemplate::parse("{0.1,abc}"),
            Err(TemplateError::Malformed(_))
        ));
        assert!(matches!(
            BiometricTemplate::parse("[0.1,"),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn test_pg_array_round_trip() {
        let t = BiometricTemplate::from_raw(vec![0.6, 0.8]).unwrap();
        let text = t.to_pg_array();
        assert!(text.starts_with('{') && text.ends_with('}'));
        let back = BiometricTemplate::parse(&text).unwrap();
        assert!((back.similarity(&t).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similarity_is_dot_product() {
        let a = BiometricTemplate::from_raw(vec![1.0, 0.0]).unwrap();
        let b = BiometricTemplate::from_raw(vec![1.0, 1.0]).unwrap();
        let sim = a.similarity(&b).unwrap();
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        let a = BiometricTemplate::from_raw(vec![1.0, 0.0]).unwrap();
        let b = BiometricTemplate::from_raw(vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(a.similarity(&b), None);
    }
}
