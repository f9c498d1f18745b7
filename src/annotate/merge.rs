use std::collections::BTreeMap;
use tracing::warn;

use super::links::render_link;
use crate::matcher::MatchSpan;
use crate::retag::TARGET_RETAG;

/// One dictionary's spans over an element, with the template its links render through.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationLayer<'a> {
    pub dictionary: &'a str,
    pub link_template: &'a str,
    pub spans: &'a [MatchSpan],
}

/// Inserts `(link,link,...)` right after every matched substring of `original`.
///
/// Links are grouped by end offset, so a position matched by several layers
/// gets a single parenthesized list, in layer order. Spans that do not fit
/// the text are skipped. With no valid spans the original is returned as is.
pub fn render_element(original: &str, layers: &[AnnotationLayer<'_>]) -> String {
    let mut links: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    for layer in layers {
        for span in layer.spans {
            if span.start > span.end || span.surface(original).is_none() {
                warn!(
                    target: TARGET_RETAG,
                    "Skipping span [{}, {}] of '{}': does not fit a {} byte text",
                    span.start,
                    span.end,
                    layer.dictionary,
                    original.len()
                );
                continue;
            }
            links
                .entry(span.end + 1)
                .or_default()
                .extend(span.bindings.iter().map(|b| render_link(layer.link_template, b)));
        }
    }

    let mut rendered = String::with_capacity(original.len());
    let mut taken = 0;
    for (insert_at, group) in links {
        if group.is_empty() {
            continue;
        }
        rendered.push_str(&original[taken..insert_at]);
        rendered.push('(');
        rendered.push_str(&group.join(","));
        rendered.push(')');
        taken = insert_at;
    }
    rendered.push_str(&original[taken..]);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Binding;

    fn span(start: usize, end: usize, bindings: &[(i32, &str)]) -> MatchSpan {
        MatchSpan {
            start,
            end,
            bindings: bindings.iter().map(|(t, id)| Binding::new(*t, id)).collect(),
        }
    }

    fn layer<'a>(dictionary: &'a str, template: &'a str, spans: &'a [MatchSpan]) -> AnnotationLayer<'a> {
        AnnotationLayer {
            dictionary,
            link_template: template,
            spans,
        }
    }

    #[test]
    fn test_no_spans_is_identity() {
        let text = "Aspirin in patients with héart disease";
        assert_eq!(render_element(text, &[]), text);
        assert_eq!(render_element(text, &[layer("chembl", "{id}", &[])]), text);
        assert_eq!(render_element("", &[]), "");
    }

    #[test]
    fn test_link_after_match() {
        let spans = [span(0, 2, &[(-1, "X1")])];
        assert_eq!(
            render_element("ABC compound", &[layer("chembl", "<link {id}>", &spans)]),
            "ABC(<link X1>) compound"
        );
    }

    #[test]
    fn test_same_end_offset_is_visited_once() {
        let chembl = [span(0, 2, &[(-1, "X1")])];
        let pubchem = [span(1, 2, &[(-2, "2244"), (-2, "2245")]), span(4, 11, &[(-2, "9")])];
        let rendered = render_element(
            "ABC compound",
            &[
                layer("chembl", "C:{id}", &chembl),
                layer("pubchem", "P:{id}", &pubchem),
            ],
        );
        assert_eq!(rendered, "ABC(C:X1,P:2244,P:2245) compound(P:9)");
    }

    #[test]
    fn test_invalid_spans_are_skipped() {
        let text = "é ABC";
        // End inside the two-byte 'é', end past the text, start after end
        let spans = [
            span(0, 0, &[(-1, "bad")]),
            span(3, 40, &[(-1, "bad")]),
            span(4, 3, &[(-1, "bad")]),
            span(3, 5, &[(-1, "X1")]),
        ];
        assert_eq!(render_element(text, &[layer("chembl", "{id}", &spans)]), "é ABC(X1)");
    }
}
