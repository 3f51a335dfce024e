//! Handlers the server binary can host, plus the host-side camera mirror.

pub mod camera;
pub mod camera_mirror;
pub mod echo;
pub mod parameters;

pub use camera::{CameraControl, CameraFactory, CameraSignal, RemoteCameraHandler, SimulatedCamera};
pub use camera_mirror::CameraMirror;
pub use echo::EchoHandler;
pub use parameters::ParameterStoreHandler;
