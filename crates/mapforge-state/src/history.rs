//! Coalesced event history: the record SYNC replays.
//!
//! The history maps a [`HistoryKey`] to the latest [`HistoryEntry`]
//! describing that effect. It never grows without bound on the same
//! object: creating an object collapses its earlier patches, list edits
//! cancel against each other, and whole-attribute updates merge.
//!
//! Keys sort in replay order. [`HistoryKey`]'s variants are declared
//! loads, unloads, creations, then patches, and the derived `Ord`
//! compares the variant first, so walking the `BTreeMap` front to back
//! replays every load before any unload, every unload before any
//! creation, and every creation before any patch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use mapforge_protocol::{
    ClearFromPayload, CreatureType, LoadFromPayload, LoadObjectPayload, Message,
    ObjAttributesPayload, PlaceSomeonePayload, UpdateObjAttributesPayload,
};
use serde_json::Value;

/// What one history entry is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HistoryKey {
    /// A map file was loaded (`llf:` local, `lsf:` server).
    Load { file: String, local: bool },
    /// A map file's objects were unloaded (`ulf:` / `usf:`).
    Unload { file: String, local: bool },
    /// An object or creature was created (`new:<id>`).
    New(String),
    /// Values pending addition to a list attribute (`add:<id>:<attr>`).
    Add { id: String, attr: String },
    /// Values pending removal from a list attribute (`del:<id>:<attr>`).
    Del { id: String, attr: String },
    /// Pending whole-attribute replacements (`mod:<id>`).
    Mod(String),
}

impl HistoryKey {
    /// The map object this key patches or creates, if any.
    pub fn object_id(&self) -> Option<&str> {
        match self {
            Self::New(id) | Self::Mod(id) => Some(id),
            Self::Add { id, .. } | Self::Del { id, .. } => Some(id),
            Self::Load { .. } | Self::Unload { .. } => None,
        }
    }

    fn add(id: &str, attr: &str) -> Self {
        Self::Add {
            id: id.to_owned(),
            attr: attr.to_owned(),
        }
    }

    fn del(id: &str, attr: &str) -> Self {
        Self::Del {
            id: id.to_owned(),
            attr: attr.to_owned(),
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load { file, local: true } => write!(f, "llf:{file}"),
            Self::Load { file, local: false } => write!(f, "lsf:{file}"),
            Self::Unload { file, local: true } => write!(f, "ulf:{file}"),
            Self::Unload { file, local: false } => write!(f, "usf:{file}"),
            Self::New(id) => write!(f, "new:{id}"),
            Self::Add { id, attr } => write!(f, "add:{id}:{attr}"),
            Self::Del { id, attr } => write!(f, "del:{id}:{attr}"),
            Self::Mod(id) => write!(f, "mod:{id}"),
        }
    }
}

/// The message that reproduces one recorded effect.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    Creature(PlaceSomeonePayload),
    Element(LoadObjectPayload),
    Added(ObjAttributesPayload),
    Removed(ObjAttributesPayload),
    Modified(UpdateObjAttributesPayload),
    Loaded(LoadFromPayload),
    Unloaded(ClearFromPayload),
}

impl HistoryEntry {
    /// The message to send a client to reproduce this effect.
    pub fn to_message(&self) -> Message {
        match self {
            Self::Creature(p) => Message::PlaceSomeone(p.clone()),
            Self::Element(p) => Message::LoadObject(p.clone()),
            Self::Added(p) => Message::AddObjAttributes(p.clone()),
            Self::Removed(p) => Message::RemoveObjAttributes(p.clone()),
            Self::Modified(p) => Message::UpdateObjAttributes(p.clone()),
            Self::Loaded(p) => Message::LoadFrom(p.clone()),
            Self::Unloaded(p) => Message::ClearFrom(p.clone()),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Creature(_) => "creature",
            Self::Element(_) => "element",
            Self::Added(_) => "added values",
            Self::Removed(_) => "removed values",
            Self::Modified(_) => "modified attributes",
            Self::Loaded(_) => "loaded file",
            Self::Unloaded(_) => "unloaded file",
        }
    }
}

/// Direction of a list-attribute patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Patch {
    Add,
    Remove,
}

/// The coalesced history of map-object and file events.
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    entries: BTreeMap<HistoryKey, HistoryEntry>,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &HistoryKey) -> Option<&HistoryEntry> {
        self.entries.get(key)
    }

    /// Entries in replay order.
    pub fn iter(&self) -> impl Iterator<Item = (&HistoryKey, &HistoryEntry)> {
        self.entries.iter()
    }

    /// The messages that rebuild the recorded state, in replay order.
    pub fn replay(&self) -> Vec<Message> {
        self.entries.values().map(HistoryEntry::to_message).collect()
    }

    // -----------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------

    /// `PS`: a creature appears. Supersedes every pending patch for its ID.
    pub fn place_creature(&mut self, creature: &PlaceSomeonePayload) {
        self.remove_object(&creature.id);
        self.entries.insert(
            HistoryKey::New(creature.id.clone()),
            HistoryEntry::Creature(creature.clone()),
        );
    }

    /// `LS`: a map element appears. Supersedes every pending patch for its ID.
    pub fn load_object(&mut self, element: &LoadObjectPayload) {
        self.remove_object(&element.id);
        self.entries.insert(
            HistoryKey::New(element.id.clone()),
            HistoryEntry::Element(element.clone()),
        );
    }

    // -----------------------------------------------------------------
    // Patches
    // -----------------------------------------------------------------

    /// `OA+`: values join a list attribute.
    pub fn add_values(&mut self, patch: &ObjAttributesPayload) {
        self.patch_values(patch, Patch::Add);
    }

    /// `OA-`: values leave a list attribute.
    pub fn remove_values(&mut self, patch: &ObjAttributesPayload) {
        self.patch_values(patch, Patch::Remove);
    }

    fn patch_values(&mut self, patch: &ObjAttributesPayload, direction: Patch) {
        // If an `OA` already replaced this attribute with a list, the
        // replay will send that `mod:` record after any `add:`/`del:`
        // records, and it would wipe them out. So fold the patch into the
        // pending list itself instead of recording it separately.
        if self.patch_modified(patch, direction) {
            return;
        }

        // Otherwise keep one pending `add:` and one pending `del:` record
        // per (object, attribute). A value already waiting in the opposite
        // record cancels out against the new one (add then delete leaves
        // nothing to replay); what is left over joins the same-direction
        // record, once.

        let (same_key, opposite_key) = match direction {
            Patch::Add => (
                HistoryKey::add(&patch.obj_id, &patch.attr_name),
                HistoryKey::del(&patch.obj_id, &patch.attr_name),
            ),
            Patch::Remove => (
                HistoryKey::del(&patch.obj_id, &patch.attr_name),
                HistoryKey::add(&patch.obj_id, &patch.attr_name),
            ),
        };

        let mut opposite = self.take_values(&opposite_key);
        let mut same = self.take_values(&same_key).unwrap_or_else(|| ObjAttributesPayload {
            obj_id: patch.obj_id.clone(),
            attr_name: patch.attr_name.clone(),
            values: Vec::new(),
        });

        for value in &patch.values {
            if let Some(pending) = opposite.as_mut() {
                if let Some(pos) = pending.values.iter().position(|v| v == value) {
                    pending.values.remove(pos);
                    continue;
                }
            }
            if !same.values.contains(value) {
                same.values.push(value.clone());
            }
        }

        self.put_values(same_key, same, direction);
        if let Some(pending) = opposite {
            let reverse = match direction {
                Patch::Add => Patch::Remove,
                Patch::Remove => Patch::Add,
            };
            self.put_values(opposite_key, pending, reverse);
        }
    }

    /// Applies a list patch directly to a pending `mod:` record that
    /// already replaces the same attribute with a list. Returns `false`
    /// when there is no such record.
    fn patch_modified(&mut self, patch: &ObjAttributesPayload, direction: Patch) -> bool {
        let key = HistoryKey::Mod(patch.obj_id.clone());
        let Some(HistoryEntry::Modified(modified)) = self.entries.get_mut(&key) else {
            return false;
        };
        let Some(Value::Array(list)) = modified.new_attrs.get_mut(&patch.attr_name) else {
            return false;
        };
        for value in &patch.values {
            let value = Value::String(value.clone());
            match direction {
                Patch::Add if !list.contains(&value) => list.push(value),
                Patch::Add => {}
                Patch::Remove => list.retain(|v| *v != value),
            }
        }
        true
    }

    /// `OA`: whole attributes are replaced.
    ///
    /// Newer values win over the pending record's; any pending list
    /// patches for the overwritten attributes are dropped.
    pub fn update_attrs(&mut self, update: &UpdateObjAttributesPayload) {
        // A replaced attribute makes earlier list patches to it moot: the
        // replay would apply them and then overwrite them anyway.
        for attr in update.new_attrs.keys() {
            self.entries.remove(&HistoryKey::add(&update.obj_id, attr));
            self.entries.remove(&HistoryKey::del(&update.obj_id, attr));
        }

        let mut merged = self
            .take_modified(&update.obj_id)
            .unwrap_or_else(|| UpdateObjAttributesPayload {
                obj_id: update.obj_id.clone(),
                new_attrs: BTreeMap::new(),
            });
        merged
            .new_attrs
            .extend(update.new_attrs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.entries.insert(
            HistoryKey::Mod(update.obj_id.clone()),
            HistoryEntry::Modified(merged),
        );
    }

    // -----------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------

    /// `L`: a map file is loaded. Cache-only loads change nothing on the
    /// map and are not recorded.
    pub fn load_file(&mut self, load: &LoadFromPayload) {
        if load.cache_only {
            tracing::debug!(file = %load.file.file, "cache-only load not recorded");
            return;
        }
        let (file, local) = (load.file.file.clone(), load.file.is_local_file);
        self.entries.remove(&HistoryKey::Unload {
            file: file.clone(),
            local,
        });
        self.entries
            .insert(HistoryKey::Load { file, local }, HistoryEntry::Loaded(load.clone()));
    }

    /// `CLR@`: a map file's objects are unloaded.
    pub fn unload_file(&mut self, unload: &ClearFromPayload) {
        let (file, local) = (unload.file.file.clone(), unload.file.is_local_file);
        self.entries.remove(&HistoryKey::Load {
            file: file.clone(),
            local,
        });
        self.entries.insert(
            HistoryKey::Unload { file, local },
            HistoryEntry::Unloaded(unload.clone()),
        );
    }

    // -----------------------------------------------------------------
    // Clearing
    // -----------------------------------------------------------------

    /// `CLR`: forgets objects.
    ///
    /// | target    | removes                                                  |
    /// |-----------|----------------------------------------------------------|
    /// | `*`       | everything                                               |
    /// | `E*`      | everything except creatures and their patches            |
    /// | `M*`/`P*` | monster / player creatures and their patches             |
    /// | `=<name>` | the creature called `<name>` and its patches             |
    /// | `<id>`    | that object and its patches                              |
    ///
    /// IDs are compared exactly; clearing `a1` leaves `xa1` alone.
    pub fn clear(&mut self, target: &str) {
        match target {
            "*" => self.entries.clear(),
            "E*" => {
                let creatures = self.creature_ids(None);
                self.entries.retain(|key, entry| match key {
                    HistoryKey::New(_) => matches!(entry, HistoryEntry::Creature(_)),
                    HistoryKey::Add { id, .. } | HistoryKey::Del { id, .. } | HistoryKey::Mod(id) => {
                        creatures.contains(id)
                    }
                    HistoryKey::Load { .. } | HistoryKey::Unload { .. } => false,
                });
            }
            "M*" => self.clear_creatures(CreatureType::Monster),
            "P*" => self.clear_creatures(CreatureType::Player),
            _ => {
                let id = match target.strip_prefix('=') {
                    Some(name) => match self.creature_named(name) {
                        Some(id) => id,
                        None => {
                            tracing::debug!(name, "no recorded creature by that name to clear");
                            return;
                        }
                    },
                    None => target.to_owned(),
                };
                self.remove_object(&id);
            }
        }
    }

    fn clear_creatures(&mut self, kind: CreatureType) {
        for id in self.creature_ids(Some(kind)) {
            self.remove_object(&id);
        }
    }

    fn creature_ids(&self, kind: Option<CreatureType>) -> BTreeSet<String> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                HistoryEntry::Creature(c) if kind.is_none_or(|k| k == c.creature_type) => {
                    Some(c.id.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn creature_named(&self, name: &str) -> Option<String> {
        self.entries.values().find_map(|entry| match entry {
            HistoryEntry::Creature(c) if c.name == name => Some(c.id.clone()),
            _ => None,
        })
    }

    /// Removes an object's creation record and all of its patches.
    fn remove_object(&mut self, id: &str) {
        self.entries
            .retain(|key, _| key.object_id() != Some(id));
    }

    // -----------------------------------------------------------------
    // Typed access
    // -----------------------------------------------------------------

    /// Removes and returns the value list stored under an `add:`/`del:`
    /// key. An entry of the wrong type is discarded with a warning.
    fn take_values(&mut self, key: &HistoryKey) -> Option<ObjAttributesPayload> {
        match (key, self.entries.remove(key)?) {
            (HistoryKey::Add { .. }, HistoryEntry::Added(p))
            | (HistoryKey::Del { .. }, HistoryEntry::Removed(p)) => Some(p),
            (_, stale) => {
                tracing::warn!(%key, found = stale.kind_name(), "discarding history entry of unexpected type");
                None
            }
        }
    }

    /// Removes and returns the `mod:` record for `id`. An entry of the
    /// wrong type is discarded with a warning.
    fn take_modified(&mut self, id: &str) -> Option<UpdateObjAttributesPayload> {
        let key = HistoryKey::Mod(id.to_owned());
        match self.entries.remove(&key)? {
            HistoryEntry::Modified(p) => Some(p),
            stale => {
                tracing::warn!(%key, found = stale.kind_name(), "discarding history entry of unexpected type");
                None
            }
        }
    }

    fn put_values(&mut self, key: HistoryKey, values: ObjAttributesPayload, direction: Patch) {
        if values.values.is_empty() {
            return;
        }
        let entry = match direction {
            Patch::Add => HistoryEntry::Added(values),
            Patch::Remove => HistoryEntry::Removed(values),
        };
        self.entries.insert(key, entry);
    }
}
