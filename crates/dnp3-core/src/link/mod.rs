pub mod codec;
pub mod frame;
pub mod layer;

pub use codec::{encode_frame, frame_bytes, FrameCodec};
pub use frame::{Frame, FrameHeader, LinkFunction};
pub use layer::{DataLinkLayer, Outbound, PrimaryState};
