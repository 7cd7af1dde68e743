//! Transport front-ends
//!
//! Each front-end adapts one wire shape to the session's `FrameReader` /
//! `FrameWriter` pair; all chat logic lives in the session handler.

pub mod line;
pub mod websocket;
