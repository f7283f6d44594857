//! The model: root aggregate of a simulation run.
//!
//! A [`Model`] owns the period clock, the hook registry, the parameter
//! store, the agent and goods registries, the shock manager, the data
//! collector, the milestones and the optional spatial grid. Every hook,
//! reporter and callback receives the model explicitly; there is no
//! ambient model state.
//!
//! This module holds construction, configuration and the entity lifecycle.
//! The period loop and the run-state machine ([`crate::runner`]) extend
//! `Model` from their own modules.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tessera_types::{
    CheckEntry, EntityId, ExecutionOrder, ParamValue, Position, RunState, Stage, Value,
};
use tracing::{debug, error, info, warn};

use crate::agents::{AgentError, Agents, Breed, Entity, PrimitiveSpec};
use crate::clock::PeriodClock;
use crate::config::SimulationConfig;
use crate::data::{DataCollector, Stat};
use crate::error::{Failure, FailureSource, ModelError};
use crate::goods::{GoodSpec, Goods};
use crate::hooks::{EventKind, HookKey, Hooks};
use crate::milestones::Milestones;
use crate::operator::{ControlHandle, ModelObserver, RunStatus};
use crate::params::{EntryKind, ParamDef, ParamKind, ParamScope, Params};
use crate::shocks::{ShockAction, Shocks};
use crate::spatial::{GridConfig, Grid, PATCH_PRIMITIVE, PATCH_PRIORITY, SpatialError};

/// Built-in parameter: stop condition (`Fixed(period)` or
/// `Predicate(milestone)`).
pub const STOP_AFTER: &str = "stopafter";

/// Built-in parameter: series export path written at termination.
pub const CSV_EXPORT: &str = "csv";

/// Built-in parameter: observer notification interval in periods.
pub const REFRESH: &str = "refresh";

/// Name of the population parameter of a primitive.
pub fn population_param(primitive: &str) -> String {
    format!("num_{primitive}")
}

/// Position of the loop inside a period that has begun but not finished.
#[derive(Debug, Clone)]
pub(crate) struct PeriodCursor {
    /// The stage to run next, 1-based.
    pub(crate) next_stage: Stage,
    /// Entities live at the start of the period, in stepping order.
    pub(crate) order: Arc<[EntityId]>,
}

/// A simulation run.
pub struct Model {
    name: String,
    pub(crate) clock: PeriodClock,
    pub(crate) state: RunState,
    pub(crate) stages: Stage,
    pub(crate) order: ExecutionOrder,

    /// Lifecycle hooks.
    pub hooks: Hooks,
    /// Randomized and manual perturbations.
    pub shocks: Shocks,
    /// Per-period time series.
    pub data: DataCollector,
    /// Named predicates checked every period.
    pub milestones: Milestones,

    pub(crate) params: Params,
    pub(crate) agents: Agents,
    goods: Goods,
    pub(crate) grid: Option<Grid>,

    pub(crate) rng: StdRng,
    pub(crate) control: ControlHandle,
    pub(crate) observers: Vec<Box<dyn ModelObserver>>,
    pub(crate) failures: Vec<Failure>,
    pub(crate) cursor: Option<PeriodCursor>,
    pub(crate) period_shocks: Vec<String>,
    pub(crate) violation: Option<String>,
    pub(crate) setup_done: bool,
    pub(crate) setting_up: bool,
    pub(crate) setup_stop: bool,
    pub(crate) started_at: Option<DateTime<Utc>>,
    dying: BTreeSet<EntityId>,
}

impl core::fmt::Debug for Model {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("period", &self.clock.period())
            .field("state", &self.state)
            .field("stages", &self.stages)
            .field("population", &self.agents.len())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Create a model seeded from OS entropy.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rng(name, StdRng::from_os_rng())
    }

    /// Create a reproducible model.
    pub fn with_seed(name: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(name, StdRng::seed_from_u64(seed))
    }

    fn with_rng(name: impl Into<String>, rng: StdRng) -> Self {
        Self {
            name: name.into(),
            clock: PeriodClock::new(),
            state: RunState::Ready,
            stages: 1,
            order: ExecutionOrder::Sequential,
            hooks: Hooks::new(),
            shocks: Shocks::new(),
            data: DataCollector::new(),
            milestones: Milestones::new(),
            params: builtin_params(),
            agents: Agents::new(),
            goods: Goods::new(),
            grid: None,
            rng,
            control: ControlHandle::new(),
            observers: Vec::new(),
            failures: Vec::new(),
            cursor: None,
            period_shocks: Vec::new(),
            violation: None,
            setup_done: false,
            setting_up: false,
            setup_stop: false,
            started_at: None,
            dying: BTreeSet::new(),
        }
    }

    /// Build a ready model from configuration.
    pub fn from_config(config: &SimulationConfig) -> Result<Self, ModelError> {
        let settings = &config.model;
        let mut model = settings.seed.map_or_else(
            || Self::new(settings.name.clone()),
            |seed| Self::with_seed(settings.name.clone(), seed),
        );
        model.set_stages(settings.stages)?;
        model.set_order(settings.order);

        let stop_after = settings.stop_after.map_or(CheckEntry::Off, |n| {
            CheckEntry::Fixed(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
        });
        model.set_param(STOP_AFTER, None, stop_after)?;
        #[allow(clippy::cast_precision_loss)]
        let refresh = settings.refresh as f64;
        model.set_param(REFRESH, None, refresh)?;
        if let Some(path) = &settings.csv {
            model.set_param(
                CSV_EXPORT,
                None,
                CheckEntry::Fixed(Value::Text(path.clone())),
            )?;
        }

        for good in &config.goods {
            model.add_good(
                &good.name,
                GoodSpec {
                    endowment: good.endowment,
                    money: good.money,
                },
            )?;
        }
        if let Some(grid) = &config.grid {
            model.enable_grid(grid.clone())?;
        }
        for primitive in &config.primitives {
            let spec = PrimitiveSpec {
                priority: primitive.priority,
                count: primitive.count,
                max: primitive
                    .max
                    .unwrap_or_else(|| PrimitiveSpec::with_count(primitive.count).max),
            };
            model.add_primitive(&primitive.name, spec)?;
            for breed in &primitive.breeds {
                model.add_breed(&primitive.name, breed.clone())?;
            }
        }

        info!(
            model = %model.name,
            primitives = config.primitives.len(),
            goods = config.goods.len(),
            grid = config.grid.is_some(),
            "model configured"
        );
        Ok(model)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current period `t`.
    pub const fn period(&self) -> u64 {
        self.clock.period()
    }

    /// Current run state.
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Stages per period.
    pub const fn stages(&self) -> Stage {
        self.stages
    }

    /// Stage the loop will run next, while a period is in flight.
    pub fn pending_stage(&self) -> Option<Stage> {
        self.cursor.as_ref().map(|c| c.next_stage)
    }

    /// Entity iteration order.
    pub const fn order(&self) -> ExecutionOrder {
        self.order
    }

    /// Change the iteration order. Takes effect from the next period.
    pub const fn set_order(&mut self, order: ExecutionOrder) {
        self.order = order;
    }

    /// Change the number of stages per period.
    ///
    /// # Errors
    ///
    /// [`ModelError::InvalidStageCount`] for zero. While a period is in
    /// flight the change would corrupt period indexing: the run is
    /// terminated at the next boundary and
    /// [`ModelError::InvariantViolation`] is returned.
    pub fn set_stages(&mut self, stages: Stage) -> Result<(), ModelError> {
        if stages == 0 {
            return Err(ModelError::InvalidStageCount);
        }
        if self.cursor.is_some() {
            let reason = format!(
                "stage count changed from {} to {stages} during period {}",
                self.stages,
                self.clock.period()
            );
            error!(%reason, "terminating run");
            self.violation = Some(reason.clone());
            self.control.request_terminate();
            return Err(ModelError::InvariantViolation { reason });
        }
        self.stages = stages;
        Ok(())
    }

    /// The model's random stream. Seeded models are reproducible as long as
    /// every consumer draws from this stream.
    pub const fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// A handle other threads can use to stop or terminate the run.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Subscribe a front-end.
    pub fn add_observer(&mut self, observer: Box<dyn ModelObserver>) {
        self.observers.push(observer);
    }

    /// Parameter store (read-only; write through [`Model::set_param`]).
    pub const fn params(&self) -> &Params {
        &self.params
    }

    /// Agent registry (read-only).
    pub const fn agents(&self) -> &Agents {
        &self.agents
    }

    /// Goods registry.
    pub const fn goods(&self) -> &Goods {
        &self.goods
    }

    /// Failures recorded since the last period report.
    pub fn pending_failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Serializable run snapshot.
    pub fn status(&self) -> RunStatus {
        RunStatus {
            name: self.name.clone(),
            period: self.clock.period(),
            state: self.state,
            stages: self.stages,
            population: self
                .agents
                .primitive_names()
                .into_iter()
                .map(|p| (p.to_owned(), self.agents.count(p)))
                .collect::<BTreeMap<_, _>>(),
            started_at: self.started_at,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Register a primitive together with its `num_<primitive>` population
    /// parameter.
    pub fn add_primitive(&mut self, name: &str, spec: PrimitiveSpec) -> Result<(), ModelError> {
        self.ensure_live()?;
        #[allow(clippy::cast_precision_loss)]
        let def = ParamDef::slider(
            population_param(name),
            format!("Number of {name}"),
            spec.count as f64,
            0.0,
            spec.max as f64,
            1.0,
        );
        self.agents.add_primitive(name, spec)?;
        if let Err(err) = self.params.add(def, &[]) {
            let _ = self.agents.remove_primitive(name);
            return Err(err.into());
        }

        let primitive = name.to_owned();
        self.params.on_change(
            &population_param(name),
            move |model: &mut Self, _name, _item, value| model.resize_population(&primitive, value),
        )?;
        Ok(())
    }

    /// Remove a primitive before setup.
    pub fn remove_primitive(&mut self, name: &str) -> Result<(), ModelError> {
        self.agents.remove_primitive(name)?;
        self.params.remove(&population_param(name));
        Ok(())
    }

    /// Add a breed to a primitive. Per-breed parameters of the primitive
    /// get a slot for it.
    pub fn add_breed(&mut self, primitive: &str, breed: Breed) -> Result<(), ModelError> {
        let name = breed.name.clone();
        self.agents.add_breed(primitive, breed)?;
        self.params
            .extend_scope(&ParamScope::PerBreed(primitive.to_owned()), &name);
        Ok(())
    }

    /// Register a good. Per-good parameters get a slot for non-money goods.
    pub fn add_good(&mut self, name: &str, spec: GoodSpec) -> Result<(), ModelError> {
        let money = spec.money;
        self.goods.add(name, spec)?;
        if !money {
            self.params.extend_scope(&ParamScope::PerGood, name);
        }
        Ok(())
    }

    /// Register a parameter. Scoped parameters get one slot per current
    /// good or breed.
    pub fn add_param(&mut self, def: ParamDef) -> Result<(), ModelError> {
        let items: Vec<String> = match &def.scope {
            ParamScope::Global => Vec::new(),
            ParamScope::PerGood => self.goods.non_money(),
            ParamScope::PerBreed(primitive) => self
                .agents
                .breeds(primitive)?
                .iter()
                .map(|b| b.name.clone())
                .collect(),
        };
        self.params.add(def, &items)?;
        Ok(())
    }

    /// Attach a change callback to a parameter.
    pub fn on_param_change<F>(&mut self, name: &str, callback: F) -> Result<(), ModelError>
    where
        F: Fn(&mut Self, &str, Option<&str>, &ParamValue) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.params.on_change(name, callback)?;
        Ok(())
    }

    /// Read a parameter slot.
    pub fn param(&self, name: &str, item: Option<&str>) -> Result<&ParamValue, ModelError> {
        Ok(self.params.get(name, item)?)
    }

    /// Numeric view of a parameter slot.
    pub fn param_f64(&self, name: &str, item: Option<&str>) -> Option<f64> {
        self.params.get_f64(name, item)
    }

    /// Validate and store a parameter value, then run its change callback.
    ///
    /// A failing callback is recorded as a failure; the value stays set.
    ///
    /// # Errors
    ///
    /// Validation and lock errors; the stored value is unchanged.
    pub fn set_param(
        &mut self,
        name: &str,
        item: Option<&str>,
        value: impl Into<ParamValue>,
    ) -> Result<(), ModelError> {
        let stored = self.params.set(name, item, value.into())?;
        self.param_changed(name, item, &stored);
        Ok(())
    }

    /// Store a parameter value without running its change callback.
    pub fn set_param_silent(
        &mut self,
        name: &str,
        item: Option<&str>,
        value: impl Into<ParamValue>,
    ) -> Result<(), ModelError> {
        self.params.set(name, item, value.into())?;
        Ok(())
    }

    /// Toggle one flag of a checkgrid parameter, then run its callback with
    /// the whole grid.
    pub fn set_param_flag(
        &mut self,
        name: &str,
        item: Option<&str>,
        flag: &str,
        on: bool,
    ) -> Result<(), ModelError> {
        let stored = self.params.set_flag(name, item, flag, on)?;
        self.param_changed(name, item, &stored);
        Ok(())
    }

    fn param_changed(&mut self, name: &str, item: Option<&str>, value: &ParamValue) {
        let Some(callback) = self.params.callback(name) else {
            return;
        };
        if let Err(err) = callback(self, name, item, value) {
            warn!(param = name, item, error = %format!("{err:#}"), "parameter callback failed");
            self.record_failure(
                FailureSource::ParamCallback {
                    name: name.to_owned(),
                },
                &err,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Spatial Grid
    // -----------------------------------------------------------------------

    /// Enable the grid. Registers the `patch` primitive; patches are
    /// created row-major at setup.
    pub fn enable_grid(&mut self, config: GridConfig) -> Result<(), ModelError> {
        if self.grid.is_some() {
            return Err(SpatialError::AlreadyEnabled.into());
        }
        if self.setup_done {
            return Err(SpatialError::TooLate.into());
        }
        let grid = Grid::new(config)?;
        let cells = u64::try_from(grid.cell_count()).unwrap_or(u64::MAX);
        self.agents.add_primitive(
            PATCH_PRIMITIVE,
            PrimitiveSpec {
                priority: PATCH_PRIORITY,
                count: cells,
                max: cells,
            },
        )?;
        info!(
            width = grid.config().width,
            height = grid.config().height,
            wrap = grid.config().wrap,
            "grid enabled"
        );
        self.grid = Some(grid);
        Ok(())
    }

    /// The grid, if enabled.
    pub const fn grid(&self) -> Option<&Grid> {
        self.grid.as_ref()
    }

    /// The live patch on a cell.
    pub fn patch_at(&self, pos: Position) -> Option<EntityId> {
        self.grid.as_ref().and_then(|g| g.patch_at(pos))
    }

    /// Live patches around an entity's cell (or around a patch).
    pub fn neighbors(&self, id: EntityId) -> Result<Vec<EntityId>, ModelError> {
        let grid = self.grid.as_ref().ok_or(SpatialError::NotEnabled)?;
        let pos = self
            .agents
            .entity(id)?
            .position()
            .ok_or(SpatialError::Unplaced(id))?;
        Ok(grid
            .neighbor_positions(pos)
            .into_iter()
            .filter_map(|p| grid.patch_at(p))
            .filter(|p| self.agents.contains(*p))
            .collect())
    }

    /// Move a non-patch entity to a cell.
    pub fn move_entity(&mut self, id: EntityId, pos: Position) -> Result<(), ModelError> {
        let grid = self.grid.as_mut().ok_or(SpatialError::NotEnabled)?;
        if !grid.contains(pos) {
            return Err(SpatialError::OutOfBounds(pos).into());
        }
        let entity = self
            .agents
            .get_mut(id)
            .ok_or(AgentError::EntityNotFound(id))?;
        if entity.primitive() == PATCH_PRIMITIVE {
            return Err(SpatialError::PatchImmovable(id).into());
        }
        if let Some(old) = entity.position() {
            grid.vacate(id, old);
        }
        grid.place(id, pos);
        entity.set_position(Some(pos));
        Ok(())
    }

    /// Non-patch entities on a cell.
    pub fn entities_at(&self, pos: Position) -> Vec<EntityId> {
        self.grid
            .as_ref()
            .map(|g| g.occupants(pos))
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Look up a live entity.
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.agents.get(id)
    }

    /// Look up a live entity mutably (attributes, stocks).
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.agents.get_mut(id)
    }

    /// Summarize an attribute or stock across a primitive or one breed.
    pub fn stat(&self, primitive: &str, breed: Option<&str>, attr: &str, stat: Stat) -> Option<f64> {
        stat.apply(&self.agents.collect_attr(primitive, breed, attr))
    }

    /// Create `count` entities. Without an explicit breed each entity's
    /// breed comes from the first `decide_breed` handler naming a known
    /// breed, else round-robin by id. Fires `agent_init` per entity.
    ///
    /// # Errors
    ///
    /// Unknown primitive or breed, a primitive without breeds, a terminated
    /// model, or a fatal `agent_init` failure. Nothing is created in those
    /// cases: entities already made by the call are discarded again.
    pub fn create_agents(
        &mut self,
        primitive: &str,
        breed: Option<&str>,
        count: u64,
    ) -> Result<Vec<EntityId>, ModelError> {
        self.ensure_live()?;
        if self.agents.breeds(primitive)?.is_empty() {
            return Err(AgentError::NoBreeds(primitive.to_owned()).into());
        }
        if let Some(breed) = breed {
            if !self.agents.has_breed(primitive, breed) {
                return Err(AgentError::UnknownBreed {
                    primitive: primitive.to_owned(),
                    breed: breed.to_owned(),
                }
                .into());
            }
        }

        let mut created = Vec::new();
        for _ in 0..count {
            match self.spawn(primitive, breed, Vec::new(), None) {
                Ok(id) => created.push(id),
                Err(err) => {
                    for id in created {
                        self.discard(id);
                    }
                    return Err(err);
                }
            }
        }
        debug!(primitive, count, "entities created");
        Ok(created)
    }

    /// Create one offspring of `parents`. The child joins the first
    /// parent's primitive and breed (and cell, on the grid) and records its
    /// parents. Fires `agent_init`, then `agent_reproduce`. Attribute
    /// inheritance is left to hooks.
    pub fn reproduce(&mut self, parents: &[EntityId]) -> Result<EntityId, ModelError> {
        self.ensure_live()?;
        let first = parents.first().ok_or(AgentError::NoParents)?;
        let first = self.agents.entity(*first)?;
        let primitive = first.primitive().to_owned();
        let breed = first.breed().to_owned();
        let position = first.position().filter(|_| primitive != PATCH_PRIMITIVE);

        let mut unique: Vec<EntityId> = Vec::with_capacity(parents.len());
        for id in parents {
            let parent = self.agents.entity(*id)?;
            if parent.primitive() != primitive {
                return Err(AgentError::MixedParents {
                    first: primitive,
                    other: parent.primitive().to_owned(),
                }
                .into());
            }
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        let child = self.spawn(&primitive, Some(&breed), unique.clone(), position)?;
        let handlers = self.hooks.agent_reproduce.snapshot(Some(&primitive));
        self.dispatch(EventKind::AgentReproduce, handlers, |h, m| h(unique.as_slice(), child, m))?;
        debug!(child = %child, parents = ?unique, "offspring created");
        Ok(child)
    }

    /// Remove an entity. Fires `agent_die` first, then detaches it from
    /// its primitive, its relatives' lineage lists and its grid cell.
    ///
    /// Returns `false` if the entity is already being removed (a die hook
    /// killing its own subject).
    pub fn kill(&mut self, id: EntityId) -> Result<bool, ModelError> {
        if self.dying.contains(&id) {
            return Ok(false);
        }
        let primitive = self.agents.entity(id)?.primitive().to_owned();
        self.dying.insert(id);
        let handlers = self.hooks.agent_die.snapshot(Some(&primitive));
        let fired = self.dispatch(EventKind::AgentDie, handlers, |h, m| h(id, m));

        self.discard(id);
        self.dying.remove(&id);
        debug!(entity = %id, primitive, "entity removed");
        fired?;
        Ok(true)
    }

    fn spawn(
        &mut self,
        primitive: &str,
        breed: Option<&str>,
        parents: Vec<EntityId>,
        position: Option<Position>,
    ) -> Result<EntityId, ModelError> {
        let id = self.agents.allocate_id()?;
        let breed = match breed {
            Some(breed) => breed.to_owned(),
            None => self.choose_breed(primitive, id)?,
        };
        let entity = Entity::new(
            id,
            primitive,
            breed,
            parents.clone(),
            self.clock.period(),
            position,
            self.goods.endowments(),
        );
        self.agents.insert(entity)?;
        for parent in parents {
            self.agents.link_child(parent, id);
        }
        if let (Some(pos), Some(grid)) = (position, self.grid.as_mut()) {
            if primitive == PATCH_PRIMITIVE {
                grid.set_patch(pos, id)?;
            } else {
                grid.place(id, pos);
            }
        }

        let handlers = self.hooks.agent_init.snapshot(Some(primitive));
        if let Err(err) = self.dispatch(EventKind::AgentInit, handlers, |h, m| h(id, m)) {
            self.discard(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Detach an entity and free its cell without firing `agent_die`.
    fn discard(&mut self, id: EntityId) {
        let Some(entity) = self.agents.detach(id) else {
            return;
        };
        if let (Some(pos), Some(grid)) = (entity.position(), self.grid.as_mut()) {
            if entity.primitive() == PATCH_PRIMITIVE {
                grid.clear_patch(pos, id);
            } else {
                grid.vacate(id, pos);
            }
        }
    }

    fn choose_breed(&mut self, primitive: &str, id: EntityId) -> Result<String, ModelError> {
        let handlers = self.hooks.decide_breed.snapshot(Some(primitive));
        for (key, handler) in handlers {
            match handler(self, primitive, id) {
                Ok(Some(breed)) if self.agents.has_breed(primitive, &breed) => return Ok(breed),
                Ok(Some(breed)) => {
                    warn!(key = %key, primitive, breed, "decide_breed named an unknown breed");
                }
                Ok(None) => {}
                Err(err) => self.hook_failed(EventKind::DecideBreed, &key, &err)?,
            }
        }

        let breeds = self.agents.breeds(primitive)?;
        let len = u64::try_from(breeds.len()).unwrap_or(u64::MAX);
        id.0.checked_rem(len)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| breeds.get(i))
            .map(|b| b.name.clone())
            .ok_or_else(|| AgentError::NoBreeds(primitive.to_owned()).into())
    }

    /// Grow or shrink a primitive to the population parameter's value.
    /// Shrinking removes the newest entities first. No-op before setup.
    fn resize_population(&mut self, primitive: &str, value: &ParamValue) -> anyhow::Result<()> {
        if !self.setup_done || self.state == RunState::Terminated {
            return Ok(());
        }
        let Some(target) = value.as_f64().and_then(whole_number) else {
            return Ok(());
        };
        let current = u64::try_from(self.agents.count(primitive))?;
        if let Some(missing) = target.checked_sub(current).filter(|n| *n > 0) {
            self.create_agents(primitive, None, missing)?;
        } else if let Some(excess) = current.checked_sub(target).filter(|n| *n > 0) {
            let newest_first: Vec<EntityId> =
                self.agents.ids(primitive)?.into_iter().rev().collect();
            for id in newest_first.into_iter().take(usize::try_from(excess)?) {
                self.kill(id)?;
            }
        }
        info!(primitive, population = self.agents.count(primitive), "population resized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shocks
    // -----------------------------------------------------------------------

    /// Fire a shock now, whatever its timer or active flag.
    pub fn trigger_shock(&mut self, name: &str) -> Result<(), ModelError> {
        self.ensure_live()?;
        let action = self.shocks.action(name)?;
        self.run_shock(name, &action);
        Ok(())
    }

    pub(crate) fn run_shock(&mut self, name: &str, action: &Arc<ShockAction>) {
        let period = self.clock.period();
        info!(shock = name, period, "shock fired");
        if let Err(err) = action(self) {
            warn!(shock = name, period, error = %format!("{err:#}"), "shock action failed");
            self.record_failure(
                FailureSource::Shock {
                    name: name.to_owned(),
                },
                &err,
            );
        }
        self.shocks.record(name, period);
        self.period_shocks.push(name.to_owned());
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Initialize the run: `model_pre_setup`, freeze the registries, create
    /// the grid patches and every primitive's initial population, then
    /// `model_post_setup`. Runs implicitly on the first `start` or `step`.
    ///
    /// `stop` or `terminate` called from a setup hook is held until the
    /// run loop starts, which then pauses or terminates before period 0.
    pub fn setup(&mut self) -> Result<(), ModelError> {
        if self.setup_done {
            return Ok(());
        }
        if self.state != RunState::Ready {
            return Err(ModelError::InvalidTransition {
                from: self.state,
                action: "set up",
            });
        }
        self.setting_up = true;
        let result = self.run_setup();
        self.setting_up = false;
        result
    }

    fn run_setup(&mut self) -> Result<(), ModelError> {
        info!(model = %self.name, "setting up");
        self.fire(EventKind::ModelPreSetup)?;

        self.agents.freeze();
        self.goods.freeze();
        let primitives: Vec<String> = self
            .agents
            .primitive_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        for primitive in &primitives {
            let breeds: Vec<String> = self
                .agents
                .breeds(primitive)?
                .iter()
                .map(|b| b.name.clone())
                .collect();
            for breed in breeds {
                self.params
                    .extend_scope(&ParamScope::PerBreed(primitive.clone()), &breed);
            }
        }
        self.setup_done = true;

        let cells: Vec<Position> = self
            .grid
            .as_ref()
            .map(|g| g.positions().collect())
            .unwrap_or_default();
        for pos in cells {
            self.spawn(PATCH_PRIMITIVE, None, Vec::new(), Some(pos))?;
        }
        for primitive in &primitives {
            let Some(count) = self
                .params
                .get_f64(&population_param(primitive), None)
                .and_then(whole_number)
            else {
                continue;
            };
            self.create_agents(primitive, None, count)?;
        }

        self.fire(EventKind::ModelPostSetup)?;
        info!(population = self.agents.len(), "setup complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Run `handlers` in order. A failing handler is recorded and skipped,
    /// or aborts dispatch if `kind` is fatal.
    pub(crate) fn dispatch<F: ?Sized>(
        &mut self,
        kind: EventKind,
        handlers: Vec<(HookKey, Arc<F>)>,
        mut call: impl FnMut(&F, &mut Self) -> anyhow::Result<()>,
    ) -> Result<(), ModelError> {
        for (key, handler) in handlers {
            if let Err(err) = call(&*handler, self) {
                self.hook_failed(kind, &key, &err)?;
            }
        }
        Ok(())
    }

    /// Fire an event whose handlers take only the model.
    pub(crate) fn fire(&mut self, kind: EventKind) -> Result<(), ModelError> {
        let handlers = match kind {
            EventKind::ModelPreSetup => self.hooks.model_pre_setup.snapshot(None),
            EventKind::ModelPostSetup => self.hooks.model_post_setup.snapshot(None),
            EventKind::ModelPreStep => self.hooks.model_pre_step.snapshot(None),
            EventKind::ModelPostStep => self.hooks.model_post_step.snapshot(None),
            EventKind::ModelStop => self.hooks.model_stop.snapshot(None),
            EventKind::Terminate => self.hooks.terminate.snapshot(None),
            // Events with arguments are dispatched where their arguments
            // are known.
            EventKind::AgentInit
            | EventKind::AgentStep
            | EventKind::AgentDie
            | EventKind::AgentReproduce
            | EventKind::DecideBreed
            | EventKind::ModelStep
            | EventKind::ModelStart
            | EventKind::StopCondition => return Ok(()),
        };
        self.dispatch(kind, handlers, |h, m| h(m))
    }

    pub(crate) fn hook_failed(
        &mut self,
        kind: EventKind,
        key: &HookKey,
        err: &anyhow::Error,
    ) -> Result<(), ModelError> {
        let message = format!("{err:#}");
        let period = self.clock.period();
        error!(event = %kind, key = %key, period, error = %message, "hook failed");
        if self.hooks.is_fatal(kind) {
            return Err(ModelError::HookFailed {
                event: kind,
                key: key.clone(),
                message,
            });
        }
        self.failures.push(Failure {
            source: FailureSource::Hook {
                event: kind,
                key: key.clone(),
            },
            period,
            message,
        });
        Ok(())
    }

    pub(crate) fn record_failure(&mut self, source: FailureSource, err: &anyhow::Error) {
        self.failures.push(Failure {
            source,
            period: self.clock.period(),
            message: format!("{err:#}"),
        });
    }

    pub(crate) fn ensure_live(&self) -> Result<(), ModelError> {
        if self.state == RunState::Terminated {
            return Err(ModelError::Terminated);
        }
        Ok(())
    }
}

/// Built-in parameters consumed by the scheduler.
fn builtin_params() -> Params {
    let mut params = Params::new();
    let defs = [
        ParamDef::new(
            STOP_AFTER,
            "Stop on period",
            ParamKind::CheckEntry {
                entry: EntryKind::Number,
            },
            CheckEntry::Off,
        )
        .describe("Stop at this period, or after the named milestone fires"),
        ParamDef::new(
            CSV_EXPORT,
            "CSV?",
            ParamKind::CheckEntry {
                entry: EntryKind::Text,
            },
            CheckEntry::Off,
        )
        .describe("Write the collected series to this file on termination"),
        ParamDef::slider(REFRESH, "Refresh every __ periods", 1.0, 1.0, 1000.0, 1.0),
    ];
    for def in defs {
        if let Err(err) = params.add(def, &[]) {
            error!(error = %err, "built-in parameter rejected");
        }
    }
    params
}

/// A non-negative whole number as `u64`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn whole_number(n: f64) -> Option<u64> {
    if !n.is_finite() || n < 0.0 || n.fract().abs() > f64::EPSILON || n > u64::MAX as f64 {
        return None;
    }
    Some(n as u64)
}
