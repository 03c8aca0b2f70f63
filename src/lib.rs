pub mod check;
pub mod color_rgb;
pub mod disk;
pub mod error;
pub mod img_laf_to_patches;
pub mod io;
pub mod laf;
pub mod normalize;
pub mod orientation;
pub mod rgb_to_linear;
pub mod sam;
pub mod yx_to_angle;

pub use error::{Error, Result};
