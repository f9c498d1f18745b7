pub mod links;
pub mod merge;

pub use links::{render_link, DEFAULT_LINK_TEMPLATE};
pub use merge::{render_element, AnnotationLayer};
