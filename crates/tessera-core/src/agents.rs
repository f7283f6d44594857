//! Agent and breed registry.
//!
//! Entities are grouped by primitive (a top-level category such as `agent`
//! or `patch`) and tagged with one breed of that primitive. The registry
//! owns every live entity; lifecycle hooks are fired by the
//! [`Model`](crate::Model), which is the only caller of the mutating
//! operations here.
//!
//! # Ordering
//!
//! Ids are handed out from a monotonically increasing counter and never
//! reused, so the members of a primitive kept in id order are also in
//! creation order. Primitives are kept in descending priority order, ties
//! in registration order; this is the order in which they are stepped.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tessera_types::{EntityId, Position, Value};
use tracing::debug;

/// Errors raised by the agent registry.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// No primitive with this name.
    #[error("unknown primitive: {0}")]
    UnknownPrimitive(String),

    /// A primitive with this name already exists.
    #[error("primitive already registered: {0}")]
    DuplicatePrimitive(String),

    /// The primitive has no breed with this name.
    #[error("primitive {primitive} has no breed {breed}")]
    UnknownBreed {
        /// The primitive.
        primitive: String,
        /// The requested breed.
        breed: String,
    },

    /// The primitive already has a breed with this name.
    #[error("primitive {primitive} already has a breed {breed}")]
    DuplicateBreed {
        /// The primitive.
        primitive: String,
        /// The clashing breed.
        breed: String,
    },

    /// The primitive has no breeds yet (before setup adds the default one).
    #[error("primitive {0} has no breeds")]
    NoBreeds(String),

    /// No live entity with this id.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// The id counter is exhausted.
    #[error("entity id counter overflow")]
    IdOverflow,

    /// Reproduction was requested without parents.
    #[error("reproduction needs at least one parent")]
    NoParents,

    /// Parents belong to different primitives.
    #[error("parents belong to different primitives: {first} and {other}")]
    MixedParents {
        /// Primitive of the first parent.
        first: String,
        /// A differing primitive.
        other: String,
    },

    /// Primitives and breeds are fixed once the model is set up.
    #[error("primitives and breeds are fixed once the model is set up")]
    Frozen,
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A live entity: a fixed core plus open attribute and stock maps.
///
/// The core (id, membership, lineage, age, cell) is owned by the registry
/// and read through getters; callers change only attributes and stocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    id: EntityId,
    primitive: String,
    breed: String,
    parents: Vec<EntityId>,
    children: Vec<EntityId>,
    born: u64,
    age: u64,
    position: Option<Position>,
    stocks: BTreeMap<String, f64>,
    attrs: BTreeMap<String, Value>,
}

impl Entity {
    pub(crate) fn new(
        id: EntityId,
        primitive: &str,
        breed: String,
        parents: Vec<EntityId>,
        born: u64,
        position: Option<Position>,
        stocks: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            id,
            primitive: primitive.to_owned(),
            breed,
            parents,
            children: Vec::new(),
            born,
            age: 0,
            position,
            stocks,
            attrs: BTreeMap::new(),
        }
    }

    /// Unique id, stable for the entity's lifetime.
    pub const fn id(&self) -> EntityId {
        self.id
    }

    /// Owning primitive.
    pub fn primitive(&self) -> &str {
        &self.primitive
    }

    /// Breed within the primitive.
    pub fn breed(&self) -> &str {
        &self.breed
    }

    /// Live originating entities.
    pub fn parents(&self) -> &[EntityId] {
        &self.parents
    }

    /// Live offspring.
    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    /// Period of creation.
    pub const fn born(&self) -> u64 {
        self.born
    }

    /// Number of periods the entity has completed.
    pub const fn age(&self) -> u64 {
        self.age
    }

    /// Grid cell, when the grid is enabled and the entity is placed.
    pub const fn position(&self) -> Option<Position> {
        self.position
    }

    /// Holdings of every registered good.
    pub const fn stocks(&self) -> &BTreeMap<String, f64> {
        &self.stocks
    }

    /// User-defined attributes.
    pub const fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    /// Read an attribute.
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    /// Numeric view of an attribute.
    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attrs.get(name).and_then(Value::as_f64)
    }

    /// Write an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Stock of a good; zero if the entity holds none.
    pub fn stock(&self, good: &str) -> f64 {
        self.stocks.get(good).copied().unwrap_or(0.0)
    }

    /// Overwrite the stock of a good.
    pub fn set_stock(&mut self, good: impl Into<String>, amount: f64) {
        self.stocks.insert(good.into(), amount);
    }

    pub(crate) const fn grow_older(&mut self) {
        self.age = self.age.saturating_add(1);
    }

    pub(crate) const fn set_position(&mut self, pos: Option<Position>) {
        self.position = pos;
    }
}

// ---------------------------------------------------------------------------
// Primitives and Breeds
// ---------------------------------------------------------------------------

/// Declaration of a primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveSpec {
    /// Stepping priority; higher steps first.
    #[serde(default)]
    pub priority: i32,
    /// Initial population.
    #[serde(default)]
    pub count: u64,
    /// Upper bound of the population slider.
    #[serde(default = "default_max")]
    pub max: u64,
}

impl PrimitiveSpec {
    /// A primitive with the given initial population.
    pub const fn with_count(count: u64) -> Self {
        Self {
            priority: 0,
            count,
            max: if count > DEFAULT_MAX { count } else { DEFAULT_MAX },
        }
    }
}

impl Default for PrimitiveSpec {
    fn default() -> Self {
        Self::with_count(0)
    }
}

const DEFAULT_MAX: u64 = 100;

const fn default_max() -> u64 {
    DEFAULT_MAX
}

/// A named sub-type within a primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breed {
    /// Breed name, unique within its primitive.
    pub name: String,
    /// Display color hint for front-ends.
    #[serde(default)]
    pub color: Option<String>,
}

impl Breed {
    /// A breed without a color.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Primitive {
    name: String,
    spec: PrimitiveSpec,
    breeds: Vec<Breed>,
    members: BTreeSet<EntityId>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Live entities grouped by primitive.
#[derive(Debug, Clone, Default)]
pub struct Agents {
    primitives: Vec<Primitive>,
    entities: BTreeMap<EntityId, Entity>,
    next_id: u64,
    frozen: bool,
}

impl Agents {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a primitive.
    pub fn add_primitive(&mut self, name: &str, spec: PrimitiveSpec) -> Result<(), AgentError> {
        if self.frozen {
            return Err(AgentError::Frozen);
        }
        if self.primitive(name).is_some() {
            return Err(AgentError::DuplicatePrimitive(name.to_owned()));
        }
        let at = self
            .primitives
            .partition_point(|p| p.spec.priority >= spec.priority);
        debug!(primitive = name, priority = spec.priority, "primitive registered");
        self.primitives.insert(
            at,
            Primitive {
                name: name.to_owned(),
                spec,
                breeds: Vec::new(),
                members: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a primitive.
    pub fn remove_primitive(&mut self, name: &str) -> Result<(), AgentError> {
        if self.frozen {
            return Err(AgentError::Frozen);
        }
        let before = self.primitives.len();
        self.primitives.retain(|p| p.name != name);
        if before == self.primitives.len() {
            return Err(AgentError::UnknownPrimitive(name.to_owned()));
        }
        Ok(())
    }

    /// Add a breed to a primitive.
    pub fn add_breed(&mut self, primitive: &str, breed: Breed) -> Result<(), AgentError> {
        if self.frozen {
            return Err(AgentError::Frozen);
        }
        let prim = self.primitive_mut(primitive)?;
        if prim.breeds.iter().any(|b| b.name == breed.name) {
            return Err(AgentError::DuplicateBreed {
                primitive: primitive.to_owned(),
                breed: breed.name,
            });
        }
        debug!(primitive, breed = %breed.name, "breed registered");
        prim.breeds.push(breed);
        Ok(())
    }

    /// Breeds of a primitive, in registration order.
    pub fn breeds(&self, primitive: &str) -> Result<&[Breed], AgentError> {
        self.primitive(primitive)
            .map(|p| p.breeds.as_slice())
            .ok_or_else(|| AgentError::UnknownPrimitive(primitive.to_owned()))
    }

    /// Whether the primitive has a breed with this name.
    pub fn has_breed(&self, primitive: &str, breed: &str) -> bool {
        self.primitive(primitive)
            .is_some_and(|p| p.breeds.iter().any(|b| b.name == breed))
    }

    /// Primitive names in stepping order.
    pub fn primitive_names(&self) -> Vec<&str> {
        self.primitives.iter().map(|p| p.name.as_str()).collect()
    }

    /// Declaration of a primitive.
    pub fn spec(&self, primitive: &str) -> Option<&PrimitiveSpec> {
        self.primitive(primitive).map(|p| &p.spec)
    }

    /// Whether primitives and breeds are frozen.
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Look up a live entity.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Look up a live entity mutably.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// Look up a live entity, failing if it is gone.
    pub fn entity(&self, id: EntityId) -> Result<&Entity, AgentError> {
        self.entities
            .get(&id)
            .ok_or(AgentError::EntityNotFound(id))
    }

    /// Whether the entity is alive.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Ids of a primitive's live members, in creation order.
    pub fn ids(&self, primitive: &str) -> Result<Vec<EntityId>, AgentError> {
        self.primitive(primitive)
            .map(|p| p.members.iter().copied().collect())
            .ok_or_else(|| AgentError::UnknownPrimitive(primitive.to_owned()))
    }

    /// Live members of a primitive, in creation order.
    pub fn iter(&self, primitive: &str) -> impl Iterator<Item = &Entity> {
        self.primitive(primitive)
            .into_iter()
            .flat_map(|p| p.members.iter())
            .filter_map(|id| self.entities.get(id))
    }

    /// Every live entity, in id order.
    pub fn all(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Population of a primitive.
    pub fn count(&self, primitive: &str) -> usize {
        self.primitive(primitive).map_or(0, |p| p.members.len())
    }

    /// Population of one breed of a primitive.
    pub fn count_breed(&self, primitive: &str, breed: &str) -> usize {
        self.iter(primitive).filter(|e| e.breed == breed).count()
    }

    /// Total live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity is alive.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Numeric values of an attribute (or, failing that, a stock) across
    /// a primitive, optionally restricted to one breed. Entities without
    /// the attribute or stock are skipped.
    pub fn collect_attr(&self, primitive: &str, breed: Option<&str>, attr: &str) -> Vec<f64> {
        self.iter(primitive)
            .filter(|e| breed.is_none_or(|b| e.breed == b))
            .filter_map(|e| e.attr_f64(attr).or_else(|| e.stocks.get(attr).copied()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Mutation (driven by the model)
    // -----------------------------------------------------------------------

    /// Give breedless primitives a default breed named after themselves and
    /// reject further structural changes.
    pub(crate) fn freeze(&mut self) {
        for prim in &mut self.primitives {
            if prim.breeds.is_empty() {
                prim.breeds.push(Breed::new(prim.name.clone()));
            }
        }
        self.frozen = true;
    }

    /// Reserve the next id.
    pub(crate) fn allocate_id(&mut self) -> Result<EntityId, AgentError> {
        let id = EntityId(self.next_id);
        self.next_id = self.next_id.checked_add(1).ok_or(AgentError::IdOverflow)?;
        Ok(id)
    }

    /// Insert a freshly built entity into its primitive.
    pub(crate) fn insert(&mut self, entity: Entity) -> Result<(), AgentError> {
        let id = entity.id;
        let prim = self.primitive_mut(&entity.primitive)?;
        prim.members.insert(id);
        self.entities.insert(id, entity);
        Ok(())
    }

    /// Record `child` as offspring of `parent`.
    pub(crate) fn link_child(&mut self, parent: EntityId, child: EntityId) {
        if let Some(p) = self.entities.get_mut(&parent) {
            p.children.push(child);
        }
    }

    /// Remove an entity and scrub it from every relative's lineage lists.
    pub(crate) fn detach(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        if let Ok(prim) = self.primitive_mut(&entity.primitive) {
            prim.members.remove(&id);
        }
        for relative in entity.parents.iter().chain(entity.children.iter()) {
            if let Some(r) = self.entities.get_mut(relative) {
                r.children.retain(|c| *c != id);
                r.parents.retain(|p| *p != id);
            }
        }
        Some(entity)
    }

    /// Drop every entity. Primitives and breeds stay.
    pub(crate) fn clear(&mut self) {
        self.entities.clear();
        for prim in &mut self.primitives {
            prim.members.clear();
        }
    }

    fn primitive(&self, name: &str) -> Option<&Primitive> {
        self.primitives.iter().find(|p| p.name == name)
    }

    fn primitive_mut(&mut self, name: &str) -> Result<&mut Primitive, AgentError> {
        self.primitives
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| AgentError::UnknownPrimitive(name.to_owned()))
    }
}
