//! Transformations of local data that need a globally consistent view.
mod label_normalizer;
pub use label_normalizer::LabelNormalizer;
