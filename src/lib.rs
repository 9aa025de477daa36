//! `skein` issues tensor operations in program order and executes them out of order.
//!
//! Every tensor ([`NDArray`](loom::tensor::NDArray)) is a lazy handle bound to a dependency
//! token ([`Var`](loom::engine::Var)). Operations on tensors are deferred into an
//! [`Engine`](loom::engine::Engine), which orders them by the variables they read and write
//! and runs independent work concurrently on per-device execution lanes.

pub mod hal;
pub mod loom;

#[cfg(feature = "trace")]
/// Installs a global `tracing` subscriber that forwards engine spans to Tracy.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
