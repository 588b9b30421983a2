//! Media pipeline boundary: tracks, the inbound stream and the render target.

pub mod frame;
pub mod render;
pub mod stream;
pub mod track;

pub use frame::*;
pub use render::*;
pub use stream::*;
pub use track::*;
