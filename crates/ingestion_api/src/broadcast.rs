mod channel_broadcaster;

pub use channel_broadcaster::*;
