//! Rectangular gates and the gate hierarchy.
//!
//! Gate bounds live in raw (compensated, untransformed) value space. A gate
//! chain is an ordered list of rectangles; an event passes the chain only if
//! it lies inside every rectangle.

use crate::transform::Transform;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Identifier of the implicit root gate.
pub const ROOT_GATE_ID: &str = "root";

/// An axis-aligned rectangle over a channel pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRect {
    pub x_param: usize,
    pub y_param: usize,
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl GateRect {
    /// Creates a rectangle, ordering each bound pair.
    #[must_use]
    pub fn new(x_param: usize, y_param: usize, x: (f64, f64), y: (f64, f64)) -> Self {
        Self {
            x_param,
            y_param,
            x_min: x.0.min(x.1),
            x_max: x.0.max(x.1),
            y_min: y.0.min(y.1),
            y_max: y.0.max(y.1),
        }
    }

    /// Builds a raw-space gate from a rectangle drawn in display space.
    ///
    /// `tx` and `ty` are the display-space corners; they are mapped back
    /// through `transform.inverse`.
    #[must_use]
    pub fn from_display(
        x_param: usize,
        y_param: usize,
        transform: &Transform,
        tx: (f64, f64),
        ty: (f64, f64),
    ) -> Self {
        Self::new(
            x_param,
            y_param,
            (transform.inverse(tx.0), transform.inverse(tx.1)),
            (transform.inverse(ty.0), transform.inverse(ty.1)),
        )
    }

    /// Inclusive containment test. NaN coordinates are never contained.
    #[must_use]
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    /// Largest channel index referenced by this gate.
    #[must_use]
    pub fn max_param(&self) -> usize {
        self.x_param.max(self.y_param)
    }
}

/// A gate node in the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gate {
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub rect: GateRect,
}

/// Tree of gates rooted at the implicit "All Events" gate.
///
/// New gates are parented under the current selection and become the
/// selection themselves.
#[derive(Debug, Clone)]
pub struct GateTree {
    gates: Vec<Gate>,
    selected: String,
    next_id: u32,
}

impl Default for GateTree {
    fn default() -> Self {
        Self {
            gates: Vec::new(),
            selected: ROOT_GATE_ID.to_string(),
            next_id: 1,
        }
    }
}

impl GateTree {
    /// Adds a gate under the selected gate and selects it. Returns its id.
    pub fn add(&mut self, rect: GateRect) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.gates.push(Gate {
            id: id.clone(),
            name: format!("Gate {id}"),
            parent_id: self.selected.clone(),
            rect,
        });
        self.selected.clone_from(&id);
        id
    }

    /// Removes every gate and resets selection and numbering.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Currently selected gate id (`"root"` when nothing is selected).
    #[must_use]
    pub fn selected(&self) -> &str {
        &self.selected
    }

    /// Selects a gate.
    ///
    /// # Errors
    /// Returns [`Error::UnknownGate`] if `id` is neither the root nor a known gate.
    pub fn select(&mut self, id: &str) -> Result<()> {
        if id != ROOT_GATE_ID && self.get(id).is_none() {
            return Err(Error::UnknownGate(id.to_string()));
        }
        self.selected = id.to_string();
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gate> {
        self.gates.iter()
    }

    /// Replaces the bounds of a gate, keeping its channels.
    ///
    /// # Errors
    /// Returns [`Error::UnknownGate`] if no gate has this id.
    pub fn set_bounds(&mut self, id: &str, x: (f64, f64), y: (f64, f64)) -> Result<()> {
        let gate = self
            .gates
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| Error::UnknownGate(id.to_string()))?;
        gate.rect = GateRect::new(gate.rect.x_param, gate.rect.y_param, x, y);
        Ok(())
    }

    /// Ancestors of a gate, nearest first, excluding the root.
    #[must_use]
    pub fn ancestors(&self, id: &str) -> Vec<&Gate> {
        let mut out = Vec::new();
        let mut current = self.get(id);
        while let Some(gate) = current {
            if gate.parent_id == ROOT_GATE_ID {
                break;
            }
            current = self.get(&gate.parent_id);
            if let Some(parent) = current {
                out.push(parent);
            }
        }
        out
    }

    /// Gate chain for `id`: outermost ancestor first, the gate itself last.
    ///
    /// The root (or an unknown id) yields an empty chain.
    #[must_use]
    pub fn chain(&self, id: &str) -> Vec<GateRect> {
        let Some(gate) = self.get(id) else {
            return Vec::new();
        };
        let mut chain: Vec<GateRect> = self.ancestors(id).iter().rev().map(|g| g.rect).collect();
        chain.push(gate.rect);
        chain
    }

    /// Gate chain for the current selection.
    #[must_use]
    pub fn selected_chain(&self) -> Vec<GateRect> {
        self.chain(&self.selected)
    }
}
