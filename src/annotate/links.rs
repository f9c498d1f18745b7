use crate::matcher::Binding;

pub const DEFAULT_LINK_TEMPLATE: &str = "{id}";

/// Renders one binding through a link template, substituting `{id}` and `{type}`.
pub fn render_link(template: &str, binding: &Binding) -> String {
    let entity_type = binding.entity_type.to_string();
    template
        .split("{id}")
        .map(|piece| piece.replace("{type}", &entity_type))
        .collect::<Vec<_>>()
        .join(&binding.identifier)
}
