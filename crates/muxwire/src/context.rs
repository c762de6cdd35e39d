//! Services shared by every connection of a client or server.

use std::sync::Arc;

use crate::config::DispatchConfig;
use crate::dispatcher::Dispatcher;
use crate::error::TransportResult;
use crate::frame::BodyArena;
use crate::serialization::SerializationRegistry;
use crate::timer::TimingWheel;

/// Serialization registry, body accounting, the deadline wheel and the
/// decode workers. Built once and handed to connections explicitly.
#[derive(Debug)]
pub struct TransportContext {
    registry: Arc<SerializationRegistry>,
    arena: Arc<BodyArena>,
    wheel: TimingWheel,
    dispatcher: Dispatcher,
}

impl TransportContext {
    /// Context with the default serialization backends.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(dispatch: &DispatchConfig) -> TransportResult<Arc<Self>> {
        Self::with_registry(SerializationRegistry::with_defaults(), dispatch)
    }

    pub fn with_registry(
        registry: SerializationRegistry,
        dispatch: &DispatchConfig,
    ) -> TransportResult<Arc<Self>> {
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(dispatch, Arc::clone(&registry))?;
        Ok(Arc::new(Self {
            registry,
            arena: BodyArena::new(),
            wheel: TimingWheel::start(),
            dispatcher,
        }))
    }

    pub fn registry(&self) -> &Arc<SerializationRegistry> {
        &self.registry
    }

    pub fn arena(&self) -> &Arc<BodyArena> {
        &self.arena
    }

    pub fn wheel(&self) -> &TimingWheel {
        &self.wheel
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
