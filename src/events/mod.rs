pub mod window;

pub use window::{
    Resolution, ResolutionSource, ResolvedScope, WindowEvent, WindowEventType, WindowIdentity,
};
