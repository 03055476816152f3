pub mod block;
pub mod config;
pub mod efficientnet;
pub mod imagenet;
pub mod trainable;
pub mod weights;

pub use efficientnet::{BackboneRecord, EfficientNet, EfficientNetRecord, CLASSIFIER_PARAMS};
pub use weights::EfficientNetB0;
