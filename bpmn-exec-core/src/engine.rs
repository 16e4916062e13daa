//! Async facade over the interpreter.
//!
//! Each trigger loads the instance, runs one [`Vm`] pass on a copy of its
//! execution tree and saves the result with an optimistic revision check.
//! A trigger that fails leaves the stored instance untouched. Triggers for
//! the same instance are serialised through a per-instance mutex.

use crate::config::EngineConfig;
use crate::delegate::Services;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::model::{ProcessDefinition, Repository};
use crate::store::ProcessStore;
use crate::tree::{EventSubscription, EventType, ExecutionTree};
use crate::types::*;
use crate::vm::Vm;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub struct Engine {
    store: Arc<dyn ProcessStore>,
    repository: RwLock<Repository>,
    services: Arc<Services>,
    config: EngineConfig,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ProcessStore>, services: Services, config: EngineConfig) -> Self {
        Self {
            store,
            repository: RwLock::new(Repository::new()),
            services: Arc::new(services),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Definitions ──────────────────────────────────────────

    /// Store `definition` and make it the latest version of its key.
    /// Returns the version hash.
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<[u8; 32], EngineError> {
        self.store.store_definition(&definition).await?;
        let version = definition.version;
        tracing::info!(process_key = %definition.key, "deployed process definition");
        self.repository.write().await.deploy(definition);
        Ok(version)
    }

    // ─── Triggers ─────────────────────────────────────────────

    /// Start a new instance of the latest version of `process_key` and run
    /// it until every token waits or ends.
    pub async fn start(
        &self,
        process_key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let repository = self.repository.read().await.clone();
        let definition = repository.get(process_key)?;
        let instance_id = Uuid::now_v7();

        let mut tree = ExecutionTree::new();
        let report = {
            let mut vm = Vm::new(&mut tree, &repository, &self.services, &self.config);
            vm.start(process_key, variables)?;
            vm.run()?;
            vm.finish()
        };

        let instance = ProcessInstance {
            instance_id,
            process_key: definition.key.clone(),
            definition_version: definition.version,
            state: report.terminal.unwrap_or(ProcessState::Running),
            tree,
            revision: 0,
            created_at: now_ms(),
        };
        self.store.save_instance(&instance, 0).await?;

        let started = RuntimeEvent::InstanceStarted {
            instance_id,
            process_key: instance.process_key.clone(),
            definition_version: instance.definition_version,
        };
        self.append_events(instance_id, std::iter::once(started).chain(report.events))
            .await?;
        tracing::info!(%instance_id, process_key, state = ?instance.state, "instance started");
        Ok(instance_id)
    }

    /// Complete the wait state `execution` is parked in.
    pub async fn signal(
        &self,
        instance_id: Uuid,
        execution: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.run_trigger(instance_id, move |vm| vm.signal(execution, variables))
            .await
    }

    /// Complete the first execution waiting at `activity`.
    pub async fn complete_activity(
        &self,
        instance_id: Uuid,
        activity: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<ExecutionId, EngineError> {
        self.run_trigger(instance_id, move |vm| vm.complete_activity(activity, variables))
            .await
    }

    /// Deliver a message to the instance. Returns `false` when nobody was
    /// subscribed and the message was buffered.
    pub async fn correlate_message(
        &self,
        instance_id: Uuid,
        name: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<bool, EngineError> {
        self.run_trigger(instance_id, move |vm| vm.correlate_message(name, variables))
            .await
    }

    /// Deliver a signal to every subscriber in the instance.
    pub async fn broadcast_signal(
        &self,
        instance_id: Uuid,
        name: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<usize, EngineError> {
        self.run_trigger(instance_id, move |vm| vm.broadcast_signal(name, variables))
            .await
    }

    /// Fire a timer subscription. Due-time computation is the caller's job.
    pub async fn fire_timer(&self, instance_id: Uuid, subscription: u64) -> Result<(), EngineError> {
        self.run_trigger(instance_id, move |vm| vm.fire_timer(subscription))
            .await
    }

    pub async fn set_variables(
        &self,
        instance_id: Uuid,
        variables: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.run_trigger(instance_id, move |vm| vm.set_variables(variables))
            .await
    }

    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.run_trigger(instance_id, move |vm| vm.cancel(reason)).await
    }

    // ─── Queries ──────────────────────────────────────────────

    pub async fn instance(&self, instance_id: Uuid) -> Result<ProcessInstance, EngineError> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Timer subscriptions the external scheduler should fire.
    pub async fn pending_timers(&self, instance_id: Uuid) -> Result<Vec<EventSubscription>, EngineError> {
        let instance = self.instance(instance_id).await?;
        Ok(instance
            .tree
            .subscriptions()
            .filter(|s| s.event_type == EventType::Timer)
            .cloned()
            .collect())
    }

    pub async fn events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>, EngineError> {
        Ok(self.store.read_events(instance_id, from_seq).await?)
    }

    // ─── Internals ────────────────────────────────────────────

    async fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(instance_id)
            .or_default()
            .clone()
    }

    /// Give back a lock from [`Self::lock_for`]; the entry goes once no other
    /// trigger holds or waits on it.
    async fn release_lock(&self, instance_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks
            .get(&instance_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&instance_id);
        }
    }

    /// The deployed definitions, with every version the instance family is
    /// pinned to in place of a newer one under the same key.
    async fn repository_for(&self, instance: &ProcessInstance) -> Result<Repository, EngineError> {
        let mut repository = self.repository.read().await.clone();
        let pins = std::iter::once((instance.process_key.as_str(), instance.definition_version))
            .chain(instance.tree.pinned_definitions());
        for (key, version) in pins {
            let current = repository.get(key).ok().map(|d| d.version);
            if current == Some(version) {
                continue;
            }
            let pinned = self
                .store
                .load_definition(version)
                .await?
                .ok_or_else(|| EngineError::UnknownDefinition(key.to_string()))?;
            tracing::debug!(instance_id = %instance.instance_id, process_key = key, "using pinned definition version");
            repository.deploy(pinned);
        }
        Ok(repository)
    }

    async fn run_trigger<T, F>(&self, instance_id: Uuid, trigger: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Vm<'_>) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let lock = self.lock_for(instance_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(instance_id, trigger).await
        };
        self.release_lock(instance_id, lock).await;
        result
    }

    async fn run_locked<T, F>(&self, instance_id: Uuid, trigger: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Vm<'_>) -> Result<T, EngineError> + Send,
        T: Send,
    {
        let mut instance = self.instance(instance_id).await?;
        if instance.state.is_terminal() {
            return Err(EngineError::InstanceEnded(instance_id));
        }
        let repository = self.repository_for(&instance).await?;

        let mut tree = instance.tree.clone();
        let (value, report) = {
            let mut vm = Vm::new(&mut tree, &repository, &self.services, &self.config);
            let value = trigger(&mut vm)?;
            vm.run()?;
            (value, vm.finish())
        };

        instance.tree = tree;
        if let Some(state) = report.terminal {
            tracing::info!(%instance_id, ?state, "instance ended");
            instance.state = state;
        }
        instance.revision = self.store.save_instance(&instance, instance.revision).await?;
        self.append_events(instance_id, report.events).await?;
        Ok(value)
    }

    async fn append_events(
        &self,
        instance_id: Uuid,
        events: impl IntoIterator<Item = RuntimeEvent>,
    ) -> Result<(), EngineError> {
        for event in events {
            self.store.append_event(instance_id, &event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnhandledErrorPolicy;
    use crate::delegate::HandlerOutcome;
    use crate::model::ProcessBuilder;
    use crate::store::RevisionConflict;
    use crate::store_memory::MemoryStore;

    fn approval() -> ProcessDefinition {
        ProcessBuilder::new("approval")
            .start_event("start")
            .user_task("review")
            .end_event("end")
            .flow("start", "review")
            .flow("review", "end")
            .build()
            .unwrap()
    }

    fn engine(services: Services) -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            store.clone(),
            services,
            EngineConfig::new(UnhandledErrorPolicy::Fail),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn test_start_and_complete_user_task() {
        let (_, engine) = engine(Services::new());
        engine.deploy(approval()).await.unwrap();

        let id = engine.start("approval", BTreeMap::new()).await.unwrap();
        let inst = engine.instance(id).await.unwrap();
        assert_eq!(inst.state, ProcessState::Running);
        assert_eq!(inst.revision, 1);

        let mut vars = BTreeMap::new();
        vars.insert("approved".to_string(), Value::Bool(true));
        engine.complete_activity(id, "review", vars).await.unwrap();

        let inst = engine.instance(id).await.unwrap();
        assert_eq!(inst.state, ProcessState::Completed);
        assert_eq!(inst.revision, 2);

        let events = engine.events(id, 0).await.unwrap();
        assert!(matches!(events[0].1, RuntimeEvent::InstanceStarted { .. }));
        assert!(matches!(events.last().unwrap().1, RuntimeEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_trigger_on_ended_instance_is_rejected() {
        let (_, engine) = engine(Services::new());
        engine.deploy(approval()).await.unwrap();
        let id = engine.start("approval", BTreeMap::new()).await.unwrap();
        engine.cancel(id, "withdrawn").await.unwrap();

        let inst = engine.instance(id).await.unwrap();
        assert_eq!(
            inst.state,
            ProcessState::Cancelled {
                reason: "withdrawn".into()
            }
        );
        let err = engine
            .complete_activity(id, "review", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceEnded(i) if i == id));
        // failed triggers give their lock entry back too
        assert!(engine.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_trigger_leaves_instance_untouched() {
        let services = Services::new().register("charge", |_ctx| {
            Ok(HandlerOutcome::BpmnError {
                code: "DECLINED".into(),
                message: None,
            })
        });
        let (_, engine) = engine(services);
        let def = ProcessBuilder::new("order")
            .start_event("start")
            .user_task("confirm")
            .service_task("charge", "charge")
            .end_event("end")
            .flow("start", "confirm")
            .flow("confirm", "charge")
            .flow("charge", "end")
            .build()
            .unwrap();
        engine.deploy(def).await.unwrap();
        let id = engine.start("order", BTreeMap::new()).await.unwrap();
        let before = engine.instance(id).await.unwrap();
        let events_before = engine.events(id, 0).await.unwrap().len();

        let err = engine
            .complete_activity(id, "confirm", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnhandledError { ref code, .. } if code == "DECLINED"));

        let after = engine.instance(id).await.unwrap();
        assert_eq!(after.revision, before.revision);
        assert_eq!(after.tree, before.tree);
        assert_eq!(engine.events(id, 0).await.unwrap().len(), events_before);
    }

    #[tokio::test]
    async fn test_stale_save_is_a_store_error() {
        let (store, engine) = engine(Services::new());
        engine.deploy(approval()).await.unwrap();
        let id = engine.start("approval", BTreeMap::new()).await.unwrap();

        // another writer got in first
        let inst = store.load_instance(id).await.unwrap().unwrap();
        store.save_instance(&inst, inst.revision).await.unwrap();
        let err = store.save_instance(&inst, inst.revision).await.unwrap_err();
        assert!(err.downcast_ref::<RevisionConflict>().is_some());

        // the engine always reloads, so its own trigger still commits
        engine
            .complete_activity(id, "review", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(engine.instance(id).await.unwrap().revision, 3);
    }

    #[tokio::test]
    async fn test_instance_keeps_its_definition_version() {
        let (_, engine) = engine(Services::new());
        let v1 = engine.deploy(approval()).await.unwrap();
        let id = engine.start("approval", BTreeMap::new()).await.unwrap();

        let v2 = ProcessBuilder::new("approval")
            .start_event("start")
            .user_task("second_review")
            .end_event("end")
            .flow("start", "second_review")
            .flow("second_review", "end")
            .build()
            .unwrap();
        assert_ne!(engine.deploy(v2).await.unwrap(), v1);

        engine
            .complete_activity(id, "review", BTreeMap::new())
            .await
            .unwrap();
        let inst = engine.instance(id).await.unwrap();
        assert_eq!(inst.definition_version, v1);
        assert_eq!(inst.state, ProcessState::Completed);
    }

    fn kyc(task: &str) -> ProcessDefinition {
        ProcessBuilder::new("kyc")
            .start_event("start")
            .user_task(task)
            .end_event("end")
            .flow("start", task)
            .flow(task, "end")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_called_process_keeps_its_definition_version() {
        let (_, engine) = engine(Services::new());
        let onboarding = ProcessBuilder::new("onboarding")
            .start_event("start")
            .call_activity("check", "kyc", true)
            .user_task("welcome")
            .flow("start", "check")
            .flow("check", "welcome")
            .build()
            .unwrap();
        engine.deploy(kyc("work")).await.unwrap();
        engine.deploy(onboarding).await.unwrap();
        let id = engine.start("onboarding", BTreeMap::new()).await.unwrap();

        // the redeployed called process no longer has `work`
        engine.deploy(kyc("verify")).await.unwrap();
        engine
            .complete_activity(id, "work", BTreeMap::new())
            .await
            .unwrap();
        let waiting: Vec<String> = engine
            .instance(id)
            .await
            .unwrap()
            .tree
            .active_activities()
            .into_iter()
            .map(|(_, a)| a)
            .collect();
        assert_eq!(waiting, vec!["welcome".to_string()]);

        // new instances call the latest version
        let fresh = engine.start("onboarding", BTreeMap::new()).await.unwrap();
        let waiting: Vec<String> = engine
            .instance(fresh)
            .await
            .unwrap()
            .tree
            .active_activities()
            .into_iter()
            .map(|(_, a)| a)
            .collect();
        assert_eq!(waiting, vec!["verify".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (_, engine) = engine(Services::new());
        let missing = Uuid::now_v7();
        let err = engine.cancel(missing, "x").await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceNotFound(i) if i == missing));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_are_serialised() {
        let (_, engine) = engine(Services::new());
        let def = ProcessBuilder::new("fan")
            .start_event("start")
            .parallel_gateway("fork")
            .user_task("a")
            .user_task("b")
            .parallel_gateway("join")
            .end_event("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
            .build()
            .unwrap();
        engine.deploy(def).await.unwrap();
        let engine = Arc::new(engine);
        let id = engine.start("fan", BTreeMap::new()).await.unwrap();

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|task| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.complete_activity(id, task, BTreeMap::new()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let inst = engine.instance(id).await.unwrap();
        assert_eq!(inst.state, ProcessState::Completed);
        assert_eq!(inst.revision, 3);
        assert!(engine.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_timers_and_fire() {
        let (_, engine) = engine(Services::new());
        let def = ProcessBuilder::new("reminder")
            .start_event("start")
            .intermediate_catch_event("wait", crate::model::EventTrigger::Timer("PT1H".into()))
            .end_event("end")
            .flow("start", "wait")
            .flow("wait", "end")
            .build()
            .unwrap();
        engine.deploy(def).await.unwrap();
        let id = engine.start("reminder", BTreeMap::new()).await.unwrap();

        let timers = engine.pending_timers(id).await.unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].event_name.as_deref(), Some("PT1H"));

        engine.fire_timer(id, timers[0].id).await.unwrap();
        assert_eq!(engine.instance(id).await.unwrap().state, ProcessState::Completed);
        assert!(engine.pending_timers(id).await.unwrap().is_empty());
    }
}
