use serde::{Deserialize, Serialize};

/// One (entity_type, identifier) pair bound to a surface form.
///
/// On the wire a binding is the two-element array `[entity_type, identifier]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i32, String)", into = "(i32, String)")]
pub struct Binding {
    pub entity_type: i32,
    pub identifier: String,
}

impl Binding {
    pub fn new(entity_type: i32, identifier: &str) -> Self {
        Binding {
            entity_type,
            identifier: identifier.to_string(),
        }
    }
}

impl From<(i32, String)> for Binding {
    fn from((entity_type, identifier): (i32, String)) -> Self {
        Binding {
            entity_type,
            identifier,
        }
    }
}

impl From<Binding> for (i32, String) {
    fn from(binding: Binding) -> Self {
        (binding.entity_type, binding.identifier)
    }
}

type SpanTuple = (usize, usize, Vec<Binding>);

/// A single occurrence of a registered surface form.
///
/// `start` and `end` are byte offsets into the scanned text and `end` is
/// inclusive, so the matched text is `text[start..=end]`. Serialized as
/// `[start, end, [[entity_type, identifier], ...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SpanTuple", into = "SpanTuple")]
pub struct MatchSpan {
    pub start: usize,
    pub end: usize,
    pub bindings: Vec<Binding>,
}

impl MatchSpan {
    /// The matched substring, if the span fits `text`.
    pub fn surface<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.get(self.start..=self.end)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.identifier.as_str())
    }
}

impl From<SpanTuple> for MatchSpan {
    fn from((start, end, bindings): SpanTuple) -> Self {
        MatchSpan {
            start,
            end,
            bindings,
        }
    }
}

impl From<MatchSpan> for SpanTuple {
    fn from(span: MatchSpan) -> Self {
        (span.start, span.end, span.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_wire_format() {
        let span = MatchSpan {
            start: 0,
            end: 2,
            bindings: vec![Binding::new(-1, "X1"), Binding::new(9606, "P04637")],
        };
        let json = serde_json::to_string(&span).unwrap();
        assert_eq!(json, r#"[0,2,[[-1,"X1"],[9606,"P04637"]]]"#);

        let parsed: MatchSpan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, span);
    }

    #[test]
    fn test_surface_slices_inclusive_end() {
        let span = MatchSpan {
            start: 4,
            end: 11,
            bindings: vec![Binding::new(-1, "C1")],
        };
        assert_eq!(span.surface("ABC compound"), Some("compound"));
        assert_eq!(span.surface("short"), None);
    }
}
