//! Marker reconciliation.
//!
//! Turns a freshly computed marker snapshot into the minimal set of renderer commands
//! against what is currently displayed. Only attributes that changed are patched, so a
//! marker whose count ticks up does not get torn down and re-added.
//!
//! One marker may be selected. Every pass recomputes kind and visual state for all other
//! markers (collapsing anything left expanded); the selected marker keeps its expanded
//! callout until [`MarkerReconciler::deselect`] is called.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::Coordinate;

/// How a marker is drawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum MarkerKind {
    /// Named glyph
    Symbol(String),
    /// Count badge
    Number(u32),
    /// Text callout
    Text(String),
    /// Image asset
    Image(String),
}

/// Marker tint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MarkerColor {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Gray,
    Custom(String),
}

impl MarkerColor {
    /// Map a sample's free-form color tag; unknown tags pass through.
    pub fn from_tag(tag: Option<&str>) -> Self {
        let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) else {
            return MarkerColor::Red;
        };
        match tag.to_ascii_lowercase().as_str() {
            "red" => MarkerColor::Red,
            "orange" => MarkerColor::Orange,
            "yellow" => MarkerColor::Yellow,
            "green" => MarkerColor::Green,
            "blue" => MarkerColor::Blue,
            "purple" => MarkerColor::Purple,
            "gray" | "grey" => MarkerColor::Gray,
            _ => MarkerColor::Custom(tag.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VisualState {
    Normal,
    Selected,
}

/// Desired display state for one marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerModel {
    pub id: String,
    pub coordinate: Coordinate,
    pub kind: MarkerKind,
    pub color: MarkerColor,
    pub caption: Option<String>,
}

/// A marker as currently displayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerRecord {
    pub id: String,
    pub coordinate: Coordinate,
    pub kind: MarkerKind,
    pub color: MarkerColor,
    pub caption: Option<String>,
    pub visual_state: VisualState,
}

/// Changed attributes of one marker. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinate: Option<Coordinate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MarkerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<MarkerColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_state: Option<VisualState>,
}

impl MarkerPatch {
    /// Attributes of `to` that differ from `from`.
    pub fn between(from: &MarkerRecord, to: &MarkerRecord) -> Self {
        Self {
            coordinate: (from.coordinate != to.coordinate).then_some(to.coordinate),
            kind: (from.kind != to.kind).then(|| to.kind.clone()),
            color: (from.color != to.color).then(|| to.color.clone()),
            caption: (from.caption != to.caption).then(|| to.caption.clone()),
            visual_state: (from.visual_state != to.visual_state).then_some(to.visual_state),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coordinate.is_none()
            && self.kind.is_none()
            && self.color.is_none()
            && self.caption.is_none()
            && self.visual_state.is_none()
    }

    pub fn apply_to(&self, record: &mut MarkerRecord) {
        if let Some(coordinate) = self.coordinate {
            record.coordinate = coordinate;
        }
        if let Some(kind) = &self.kind {
            record.kind = kind.clone();
        }
        if let Some(color) = &self.color {
            record.color = color.clone();
        }
        if let Some(caption) = &self.caption {
            record.caption = caption.clone();
        }
        if let Some(state) = self.visual_state {
            record.visual_state = state;
        }
    }
}

/// Command for the renderer collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "op")]
pub enum RenderCommand {
    Add { record: MarkerRecord },
    Update { id: String, patch: MarkerPatch },
    Remove { id: String },
}

/// Result of diffing two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_add: Vec<MarkerRecord>,
    pub to_update: Vec<(String, MarkerPatch)>,
    pub to_remove: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Removes first, then updates, then adds.
    pub fn into_commands(self) -> Vec<RenderCommand> {
        let mut commands =
            Vec::with_capacity(self.to_add.len() + self.to_update.len() + self.to_remove.len());
        commands.extend(self.to_remove.into_iter().map(|id| RenderCommand::Remove { id }));
        commands.extend(
            self.to_update
                .into_iter()
                .map(|(id, patch)| RenderCommand::Update { id, patch }),
        );
        commands.extend(self.to_add.into_iter().map(|record| RenderCommand::Add { record }));
        commands
    }
}

/// Diff displayed records against desired records.
pub fn diff(
    previous: &BTreeMap<String, MarkerRecord>,
    desired: &BTreeMap<String, MarkerRecord>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for id in previous.keys() {
        if !desired.contains_key(id) {
            plan.to_remove.push(id.clone());
        }
    }

    for (id, record) in desired {
        match previous.get(id) {
            Some(old) => {
                let patch = MarkerPatch::between(old, record);
                if !patch.is_empty() {
                    plan.to_update.push((id.clone(), patch));
                }
            }
            None => plan.to_add.push(record.clone()),
        }
    }

    plan
}

/// Owner of the displayed marker set for one layer.
#[derive(Debug, Default)]
pub struct MarkerReconciler {
    records: BTreeMap<String, MarkerRecord>,
    models: BTreeMap<String, MarkerModel>,
    selected: Option<String>,
}

impl MarkerReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the model should produce given the current selection.
    fn resolve(&self, model: &MarkerModel) -> MarkerRecord {
        let selected = self.selected.as_deref() == Some(model.id.as_str());
        let (kind, visual_state) = if selected {
            let label = model.caption.clone().unwrap_or_else(|| model.id.clone());
            (MarkerKind::Text(label), VisualState::Selected)
        } else {
            (model.kind.clone(), VisualState::Normal)
        };
        MarkerRecord {
            id: model.id.clone(),
            coordinate: model.coordinate,
            kind,
            color: model.color.clone(),
            caption: model.caption.clone(),
            visual_state,
        }
    }

    /// Replace the snapshot with `models` and return the commands that get the renderer there.
    ///
    /// Duplicate ids keep the last model.
    pub fn reconcile(&mut self, models: Vec<MarkerModel>) -> Vec<RenderCommand> {
        let models: BTreeMap<String, MarkerModel> =
            models.into_iter().map(|m| (m.id.clone(), m)).collect();
        let desired: BTreeMap<String, MarkerRecord> = models
            .iter()
            .map(|(id, model)| (id.clone(), self.resolve(model)))
            .collect();

        let plan = diff(&self.records, &desired);
        if !plan.is_empty() {
            debug!(
                "[MarkerReconciler] +{} ~{} -{}",
                plan.to_add.len(),
                plan.to_update.len(),
                plan.to_remove.len()
            );
        }

        self.records = desired;
        self.models = models;
        plan.into_commands()
    }

    /// Re-resolve one id and patch its record.
    fn refresh(&mut self, id: &str) -> Option<RenderCommand> {
        let model = self.models.get(id)?;
        let next = self.resolve(model);
        let record = self.records.get_mut(id)?;
        let patch = MarkerPatch::between(record, &next);
        if patch.is_empty() {
            return None;
        }
        patch.apply_to(record);
        Some(RenderCommand::Update {
            id: id.to_string(),
            patch,
        })
    }

    /// Select `id`, collapsing the previously selected marker.
    ///
    /// Selecting an id that is not displayed is allowed; it expands once it appears.
    pub fn select(&mut self, id: &str) -> Vec<RenderCommand> {
        if self.selected.as_deref() == Some(id) {
            return Vec::new();
        }
        let previous = self.selected.replace(id.to_string());

        let mut commands = Vec::new();
        if let Some(previous) = previous {
            commands.extend(self.refresh(&previous));
        }
        commands.extend(self.refresh(id));
        commands
    }

    /// Clear the selection.
    pub fn deselect(&mut self) -> Vec<RenderCommand> {
        match self.selected.take() {
            Some(previous) => self.refresh(&previous).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&MarkerRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &MarkerRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove everything from display. The selection is kept.
    pub fn clear(&mut self) -> Vec<RenderCommand> {
        self.reconcile(Vec::new())
    }
}
