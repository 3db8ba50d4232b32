// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The message router: a central registry decoupling command submitters
//! from serial links.
//!
//! Registration and state changes happen at startup (and during shutdown),
//! so a reader-writer lock over the tables is plenty. The router also owns
//! the aggregate inbound stream every module handler publishes into; a
//! background worker drains it.

use creature_common::{ControllerError, Mailbox, Result, Worker};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::protocol::{Frame, HandlerState, ModuleId};

struct Registration {
    incoming: Arc<Mailbox<Frame>>,
    outgoing: Arc<Mailbox<Frame>>,
    state: HandlerState,
}

#[derive(Default)]
struct Tables {
    modules: HashMap<ModuleId, Registration>,
}

pub struct MessageRouter {
    tables: RwLock<Tables>,
    aggregate: Arc<Mailbox<Frame>>,
    worker: std::sync::Mutex<Option<Worker>>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        MessageRouter {
            tables: RwLock::new(Tables::default()),
            aggregate: Arc::new(Mailbox::new()),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Registers a module's mailboxes. Fails if the id is already taken.
    pub fn register(
        &self,
        module: ModuleId,
        incoming: Arc<Mailbox<Frame>>,
        outgoing: Arc<Mailbox<Frame>>,
    ) -> Result<()> {
        let mut tables = self.write_tables();
        if tables.modules.contains_key(&module) {
            return Err(ControllerError::InvalidConfiguration(format!(
                "module {module} is already registered"
            )));
        }
        tables.modules.insert(
            module,
            Registration {
                incoming,
                outgoing,
                state: HandlerState::Unknown,
            },
        );
        info!(%module, "registered module");
        Ok(())
    }

    /// Moves a module's handler state along the declared lifecycle graph.
    pub fn set_state(&self, module: ModuleId, state: HandlerState) -> Result<()> {
        let mut tables = self.write_tables();
        let registration = tables.modules.get_mut(&module).ok_or_else(|| {
            ControllerError::InvalidConfiguration(format!("module {module} is not registered"))
        })?;
        if !registration.state.can_transition(state) {
            return Err(ControllerError::InvalidConfiguration(format!(
                "module {module} cannot move from {} to {state}",
                registration.state
            )));
        }
        debug!(%module, %state, "module state change");
        registration.state = state;
        Ok(())
    }

    pub fn state_of(&self, module: ModuleId) -> Option<HandlerState> {
        self.read_tables().modules.get(&module).map(|r| r.state)
    }

    /// Routes one frame to its module's outgoing mailbox.
    pub fn send(&self, frame: Frame) -> Result<()> {
        trace!(module = %frame.module, payload = %frame.payload, "routing frame");
        let tables = self.read_tables();
        match tables.modules.get(&frame.module) {
            Some(registration) => {
                registration.outgoing.push(frame);
                Ok(())
            }
            None => {
                let message = format!("unknown destination module: {}", frame.module);
                error!("{message}");
                Err(ControllerError::DestinationUnknown(frame.module.to_string()))
            }
        }
    }

    /// Enqueues a copy of `payload` for every registered module.
    pub fn broadcast(&self, payload: &str) {
        info!(%payload, "broadcasting to all modules");
        let tables = self.read_tables();
        for (module, registration) in &tables.modules {
            registration.outgoing.push(Frame::new(*module, payload));
        }
    }

    /// Publishes a frame into the aggregate inbound stream.
    pub fn received_from(&self, frame: Frame) {
        self.aggregate.push(frame);
    }

    /// True iff every registered module is Ready.
    pub fn all_ready(&self) -> bool {
        let tables = self.read_tables();
        !tables.modules.is_empty()
            && tables
                .modules
                .values()
                .all(|r| r.state == HandlerState::Ready)
    }

    /// Snapshot of registered module ids, used by the emergency-stop
    /// fanout.
    pub fn ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.read_tables().modules.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Looks up a module's incoming mailbox (the one its serial reader
    /// feeds).
    pub fn incoming_of(&self, module: ModuleId) -> Option<Arc<Mailbox<Frame>>> {
        self.read_tables()
            .modules
            .get(&module)
            .map(|r| Arc::clone(&r.incoming))
    }

    /// Looks up a module's outgoing mailbox (the one its serial writer
    /// drains).
    pub fn outgoing_of(&self, module: ModuleId) -> Option<Arc<Mailbox<Frame>>> {
        self.read_tables()
            .modules
            .get(&module)
            .map(|r| Arc::clone(&r.outgoing))
    }

    /// Starts the aggregate-stream worker. Today it only logs what the
    /// modules publish; nothing downstream consumes it yet.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let aggregate = Arc::clone(&self.aggregate);
        let worker = Worker::spawn("message-router", move |stop| {
            info!("message router running");
            while !stop.is_set() {
                match aggregate.pop_timed(Duration::from_millis(100)) {
                    Ok(Some(frame)) => {
                        debug!(module = %frame.module, payload = %frame.payload, "aggregate inbound");
                    }
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
            debug!("message router stopped");
        })
        .map_err(|e| ControllerError::Transport(e.to_string()))?;
        *self.lock_worker() = Some(worker);
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("shutting down message router");
        self.aggregate.request_shutdown();
        if let Some(mut worker) = self.lock_worker().take() {
            worker.stop(Duration::from_millis(200));
        }
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox_pair() -> (Arc<Mailbox<Frame>>, Arc<Mailbox<Frame>>) {
        (Arc::new(Mailbox::new()), Arc::new(Mailbox::new()))
    }

    fn router_with_modules(modules: &[ModuleId]) -> (MessageRouter, HashMap<ModuleId, Arc<Mailbox<Frame>>>) {
        let router = MessageRouter::new();
        let mut outgoing = HashMap::new();
        for &module in modules {
            let (incoming, out) = mailbox_pair();
            router.register(module, incoming, Arc::clone(&out)).unwrap();
            outgoing.insert(module, out);
        }
        (router, outgoing)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (router, _) = router_with_modules(&[ModuleId::A]);
        let (incoming, outgoing) = mailbox_pair();
        assert!(matches!(
            router.register(ModuleId::A, incoming, outgoing),
            Err(ControllerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn send_routes_to_the_right_outgoing_mailbox() {
        let (router, outgoing) = router_with_modules(&[ModuleId::A, ModuleId::B]);
        router.send(Frame::new(ModuleId::B, "PING\t1")).unwrap();
        assert_eq!(outgoing[&ModuleId::A].len(), 0);
        assert_eq!(outgoing[&ModuleId::B].len(), 1);
        let frame = outgoing[&ModuleId::B].pop().unwrap();
        assert_eq!(frame.module, ModuleId::B);
        assert_eq!(frame.payload, "PING\t1");
    }

    #[test]
    fn send_to_unregistered_module_fails() {
        let (router, _) = router_with_modules(&[ModuleId::A]);
        assert!(matches!(
            router.send(Frame::new(ModuleId::C, "POS\t1 2")),
            Err(ControllerError::DestinationUnknown(_))
        ));
    }

    #[test]
    fn broadcast_reaches_every_module() {
        let (router, outgoing) = router_with_modules(&[ModuleId::A, ModuleId::B, ModuleId::C]);
        router.broadcast("ESTOP\t1");
        for (module, mailbox) in &outgoing {
            let frame = mailbox.pop().unwrap();
            assert_eq!(frame.module, *module);
            assert_eq!(frame.payload, "ESTOP\t1");
        }
    }

    #[test]
    fn state_transitions_follow_the_graph() {
        let (router, _) = router_with_modules(&[ModuleId::A]);
        router.set_state(ModuleId::A, HandlerState::Idle).unwrap();
        router
            .set_state(ModuleId::A, HandlerState::AwaitingConfiguration)
            .unwrap();
        // Skipping straight to Ready is not a legal move.
        assert!(router.set_state(ModuleId::A, HandlerState::Ready).is_err());
        router
            .set_state(ModuleId::A, HandlerState::Configuring)
            .unwrap();
        router.set_state(ModuleId::A, HandlerState::Ready).unwrap();
        assert_eq!(router.state_of(ModuleId::A), Some(HandlerState::Ready));
    }

    #[test]
    fn set_state_on_unknown_module_fails() {
        let (router, _) = router_with_modules(&[ModuleId::A]);
        assert!(router.set_state(ModuleId::F, HandlerState::Idle).is_err());
    }

    #[test]
    fn all_ready_requires_every_module() {
        let (router, _) = router_with_modules(&[ModuleId::A, ModuleId::B]);
        assert!(!router.all_ready());
        for module in [ModuleId::A, ModuleId::B] {
            router.set_state(module, HandlerState::Idle).unwrap();
            router
                .set_state(module, HandlerState::AwaitingConfiguration)
                .unwrap();
            router.set_state(module, HandlerState::Configuring).unwrap();
        }
        router.set_state(ModuleId::A, HandlerState::Ready).unwrap();
        assert!(!router.all_ready());
        router.set_state(ModuleId::B, HandlerState::Ready).unwrap();
        assert!(router.all_ready());
    }

    #[test]
    fn all_ready_is_false_with_no_modules() {
        let router = MessageRouter::new();
        assert!(!router.all_ready());
    }

    #[test]
    fn ids_snapshot_is_sorted() {
        let (router, _) = router_with_modules(&[ModuleId::C, ModuleId::A, ModuleId::B]);
        assert_eq!(router.ids(), vec![ModuleId::A, ModuleId::B, ModuleId::C]);
    }

    #[test]
    fn stopped_is_terminal_through_the_router_too() {
        let (router, _) = router_with_modules(&[ModuleId::A]);
        router.set_state(ModuleId::A, HandlerState::Stopped).unwrap();
        assert!(router.set_state(ModuleId::A, HandlerState::Idle).is_err());
    }
}
