//! # Engine Registry
//!
//! Exactly one engine per `providerId`.
//!
//! ## Creation in flight
//!
//! Engine construction suspends (it may open the upstream connection). While
//! it runs, the provider's slot holds a `Pending` marker carrying a `watch`
//! receiver. A second `get_or_create` for the same provider finds the marker
//! and waits on it instead of starting a duplicate construction. The creation
//! itself runs on its own task, so a caller that goes away mid-subscribe can
//! never strand the marker: the task always settles the slot (engine on
//! success, nothing on failure) before publishing the outcome.
//!
//! ## Teardown
//!
//! `stop` removes the slot first and tears the engine down afterwards. A
//! teardown failure is logged and nothing else; a stuck upstream must never
//! keep a registry entry alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::core::ports::{PortRegistry, PortSender};
use crate::core::router::BroadcastRouter;
use crate::engines::{DistributionEngine, EngineError, EngineFactory, EngineSink};

type CreationOutcome = Result<Arc<dyn DistributionEngine>, EngineError>;

struct ReadyEngine {
    generation: u64,
    config: Value,
    engine: Arc<dyn DistributionEngine>,
}

struct PendingEngine {
    generation: u64,
    config: Value,
    outcome: watch::Receiver<Option<CreationOutcome>>,
}

enum EngineSlot {
    Ready(ReadyEngine),
    Pending(PendingEngine),
}

type Slots = Arc<Mutex<HashMap<String, EngineSlot>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, EngineSlot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An engine handed out by [`EngineRegistry::get_or_create`].
#[derive(Clone)]
pub struct AcquiredEngine {
    pub engine: Arc<dyn DistributionEngine>,
    /// Identifies this particular engine instance for [`EngineRegistry::attach`].
    pub generation: u64,
    /// The engine was created from a different config than the one supplied.
    pub config_mismatch: bool,
}

/// Result of [`EngineRegistry::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The engine generation was stopped meanwhile.
    EngineGone,
    /// The port was reaped meanwhile.
    PortGone,
}

pub struct EngineRegistry {
    factory: Arc<dyn EngineFactory>,
    router: Arc<BroadcastRouter>,
    slots: Slots,
    next_generation: AtomicU64,
}

impl EngineRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>, router: Arc<BroadcastRouter>) -> Self {
        Self {
            factory,
            router,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the engine for `provider_id`, creating it from `config` when
    /// none exists. Concurrent callers for a provider that is still being
    /// created all receive the outcome of that one creation.
    pub async fn get_or_create(&self, provider_id: &str, config: &Value) -> Result<AcquiredEngine, EngineError> {
        let (generation, config_mismatch, mut outcome) = {
            let mut slots = lock_slots(&self.slots);
            match slots.get(provider_id) {
                Some(EngineSlot::Ready(ready)) => {
                    let config_mismatch = ready.config != *config;
                    if config_mismatch {
                        log::warn!(
                            "Provider '{}' already runs with a different config; reusing the running engine",
                            provider_id
                        );
                    }
                    return Ok(AcquiredEngine {
                        engine: Arc::clone(&ready.engine),
                        generation: ready.generation,
                        config_mismatch,
                    });
                }
                Some(EngineSlot::Pending(pending)) => {
                    log::debug!("Provider '{}' creation already in flight; waiting", provider_id);
                    let config_mismatch = pending.config != *config;
                    if config_mismatch {
                        log::warn!(
                            "Provider '{}' is being created with a different config; joining that creation",
                            provider_id
                        );
                    }
                    (pending.generation, config_mismatch, pending.outcome.clone())
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    slots.insert(
                        provider_id.to_string(),
                        EngineSlot::Pending(PendingEngine {
                            generation,
                            config: config.clone(),
                            outcome: rx.clone(),
                        }),
                    );
                    self.spawn_creation(provider_id, config, generation, tx);
                    (generation, false, rx)
                }
            }
        };

        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Aborted(format!("creation of '{}' was abandoned", provider_id)))?
            .clone();

        match settled {
            Some(Ok(engine)) => Ok(AcquiredEngine {
                engine,
                generation,
                config_mismatch,
            }),
            Some(Err(err)) => Err(err),
            None => Err(EngineError::Aborted(format!("creation of '{}' produced no outcome", provider_id))),
        }
    }

    fn spawn_creation(
        &self,
        provider_id: &str,
        config: &Value,
        generation: u64,
        tx: watch::Sender<Option<CreationOutcome>>,
    ) {
        let factory = Arc::clone(&self.factory);
        let slots = Arc::clone(&self.slots);
        let sink = EngineSink::new(provider_id, Arc::clone(&self.router));
        let provider_id = provider_id.to_string();
        let config = config.clone();

        tokio::spawn(async move {
            log::info!("Creating engine for provider '{}'", provider_id);
            let build = {
                let provider_id = provider_id.clone();
                let config = config.clone();
                tokio::spawn(async move { factory.create(&provider_id, &config, sink).await })
            };
            // A panicking factory surfaces as an ordinary creation failure.
            let outcome = match build.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(EngineError::Aborted(join_err.to_string())),
            };

            let orphan = {
                let mut slots = lock_slots(&slots);
                let still_ours = matches!(
                    slots.get(&provider_id),
                    Some(EngineSlot::Pending(pending)) if pending.generation == generation
                );
                match (&outcome, still_ours) {
                    (Ok(engine), true) => {
                        slots.insert(
                            provider_id.clone(),
                            EngineSlot::Ready(ReadyEngine {
                                generation,
                                config,
                                engine: Arc::clone(engine),
                            }),
                        );
                        log::info!("Engine for provider '{}' is ready", provider_id);
                        None
                    }
                    (Err(err), true) => {
                        slots.remove(&provider_id);
                        log::error!("Engine creation for provider '{}' failed: {}", provider_id, err);
                        None
                    }
                    (Ok(engine), false) => Some(Arc::clone(engine)),
                    (Err(_), false) => None,
                }
            };

            // The slot was discarded (shutdown) while we were building.
            if let Some(engine) = orphan {
                log::warn!("Engine for provider '{}' finished after its slot was discarded; stopping it", provider_id);
                teardown(&provider_id, engine).await;
            }

            let _ = tx.send(Some(outcome));
        });
    }

    /// Lookup only. A provider still being created is not returned.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn DistributionEngine>> {
        match lock_slots(&self.slots).get(provider_id) {
            Some(EngineSlot::Ready(ready)) => Some(Arc::clone(&ready.engine)),
            _ => None,
        }
    }

    /// Adds `port_id` to the router and to the engine's subscriber tracker,
    /// but only while `generation` is still the registered engine and the port
    /// is still registered in `ports`. Nothing is added otherwise.
    ///
    /// Lock order: slots, then ports, then engine and router.
    pub fn attach(
        &self,
        ports: &PortRegistry,
        provider_id: &str,
        generation: u64,
        port_id: &str,
        sender: PortSender,
    ) -> AttachOutcome {
        let slots = lock_slots(&self.slots);
        let engine = match slots.get(provider_id) {
            Some(EngineSlot::Ready(ready)) if ready.generation == generation => &ready.engine,
            _ => return AttachOutcome::EngineGone,
        };
        let joined = ports.if_registered(port_id, || {
            self.router.add_subscriber(provider_id, port_id, sender);
            engine.register_subscriber(port_id);
        });
        match joined {
            Some(()) => AttachOutcome::Attached,
            None => AttachOutcome::PortGone,
        }
    }

    /// Stops and removes the engine for `provider_id`. A creation still in
    /// flight is left alone. Returns `true` when an engine was removed.
    pub async fn stop(&self, provider_id: &str) -> bool {
        let removed = take_ready(&mut lock_slots(&self.slots), provider_id);
        match removed {
            Some(engine) => {
                teardown(provider_id, engine).await;
                true
            }
            None => false,
        }
    }

    /// Stops the engine only if the router lists no subscriber for it. The
    /// count is read under the registry lock, so it cannot race an `attach`.
    pub async fn stop_if_unreferenced(&self, provider_id: &str) -> bool {
        let removed = {
            let mut slots = lock_slots(&self.slots);
            if self.router.subscriber_count(provider_id) > 0 {
                return false;
            }
            take_ready(&mut slots, provider_id)
        };
        match removed {
            Some(engine) => {
                teardown(provider_id, engine).await;
                true
            }
            None => false,
        }
    }

    /// Providers with a running engine, sorted.
    pub fn active_providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = lock_slots(&self.slots)
            .iter()
            .filter(|(_, slot)| matches!(slot, EngineSlot::Ready(_)))
            .map(|(provider_id, _)| provider_id.clone())
            .collect();
        providers.sort();
        providers
    }

    pub fn engine_count(&self) -> usize {
        lock_slots(&self.slots)
            .values()
            .filter(|slot| matches!(slot, EngineSlot::Ready(_)))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        lock_slots(&self.slots)
            .values()
            .filter(|slot| matches!(slot, EngineSlot::Pending(_)))
            .count()
    }

    /// Stops every engine and forgets creations in flight (their engines are
    /// stopped as soon as they finish).
    pub async fn shutdown(&self) {
        let engines: Vec<(String, Arc<dyn DistributionEngine>)> = lock_slots(&self.slots)
            .drain()
            .filter_map(|(provider_id, slot)| match slot {
                EngineSlot::Ready(ready) => Some((provider_id, ready.engine)),
                EngineSlot::Pending(_) => None,
            })
            .collect();
        log::info!("Stopping {} engine(s)", engines.len());
        for (provider_id, engine) in engines {
            teardown(&provider_id, engine).await;
        }
    }
}

/// Removes the slot for `provider_id` if it holds a running engine.
fn take_ready(slots: &mut HashMap<String, EngineSlot>, provider_id: &str) -> Option<Arc<dyn DistributionEngine>> {
    if !matches!(slots.get(provider_id), Some(EngineSlot::Ready(_))) {
        return None;
    }
    match slots.remove(provider_id) {
        Some(EngineSlot::Ready(ready)) => Some(ready.engine),
        _ => None,
    }
}

async fn teardown(provider_id: &str, engine: Arc<dyn DistributionEngine>) {
    match engine.stop().await {
        Ok(()) => log::info!("Engine for provider '{}' stopped", provider_id),
        Err(err) => log::error!("Engine for provider '{}' failed to stop cleanly: {}", provider_id, err),
    }
}
