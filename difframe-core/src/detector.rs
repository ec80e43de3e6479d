//! Multi-panel detector hierarchy.
//!
//! The hierarchy is an arena of group and panel nodes addressed by index.
//! Each node stores its frame relative to its parent; lab-frame panels are
//! resolved once at construction by folding frames from root to leaf.
#![allow(clippy::cast_precision_loss)]

use crate::error::{Error, Result};
use crate::math::{parse_axis_direction, Mat3, Vec3};
use crate::panel::{check_axes, Panel};
use crate::pixel::{MmPosition, PixelGeometry};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Origin and axes of a group relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub origin: Vec3,
    pub fast_axis: Vec3,
    pub slow_axis: Vec3,
}

impl Frame {
    /// Creates a frame, normalizing the axes.
    ///
    /// # Errors
    /// Returns `InvalidModel` for zero-length or non-orthogonal axes.
    pub fn new(origin: Vec3, fast_axis: Vec3, slow_axis: Vec3) -> Result<Self> {
        let (fast_axis, slow_axis) = check_axes(&fast_axis, &slow_axis)?;
        Ok(Self {
            origin,
            fast_axis,
            slow_axis,
        })
    }

    /// Lab frame: zero origin, fast along x, slow along y.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            origin: Vec3::zeros(),
            fast_axis: Vec3::x(),
            slow_axis: Vec3::y(),
        }
    }

    /// Rotation `[fast | slow | normal]` taking child coordinates to this frame.
    #[must_use]
    pub fn rotation(&self) -> Mat3 {
        let normal = self.fast_axis.cross(&self.slow_axis);
        Mat3::from_columns(&[self.fast_axis, self.slow_axis, normal])
    }

    /// Expresses `child`, given relative to `self`, in `self`'s parent frame.
    #[must_use]
    pub fn compose(&self, child: &Frame) -> Frame {
        let r = self.rotation();
        Frame {
            origin: self.origin + r * child.origin,
            fast_axis: r * child.fast_axis,
            slow_axis: r * child.slow_axis,
        }
    }
}

/// A node of the detector arena.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DetectorNode {
    Group {
        name: String,
        frame: Frame,
        parent: Option<usize>,
    },
    Panel {
        panel: Panel,
        parent: Option<usize>,
    },
}

impl DetectorNode {
    #[must_use]
    pub fn parent(&self) -> Option<usize> {
        match self {
            Self::Group { parent, .. } | Self::Panel { parent, .. } => *parent,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Group { name, .. } => name,
            Self::Panel { panel, .. } => panel.name(),
        }
    }

    fn local_frame(&self) -> Frame {
        match self {
            Self::Group { frame, .. } => *frame,
            Self::Panel { panel, .. } => Frame {
                origin: panel.origin(),
                fast_axis: panel.fast_axis(),
                slow_axis: panel.slow_axis(),
            },
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
struct DetectorLayout {
    nodes: Vec<DetectorNode>,
}

/// A validated detector: node arena plus resolved lab-frame panels.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(try_from = "DetectorLayout", into = "DetectorLayout")
)]
pub struct Detector {
    nodes: Vec<DetectorNode>,
    panel_nodes: Vec<usize>,
    panels: Vec<Panel>,
}

impl TryFrom<DetectorLayout> for Detector {
    type Error = Error;

    fn try_from(layout: DetectorLayout) -> Result<Self> {
        Self::from_nodes(layout.nodes)
    }
}

impl From<Detector> for DetectorLayout {
    fn from(detector: Detector) -> Self {
        Self {
            nodes: detector.nodes,
        }
    }
}

impl Detector {
    /// Single-panel detector; the panel frame is taken as lab frame.
    #[must_use]
    pub fn new(panel: Panel) -> Self {
        Self {
            nodes: vec![DetectorNode::Panel {
                panel: panel.clone(),
                parent: None,
            }],
            panel_nodes: vec![0],
            panels: vec![panel],
        }
    }

    /// Validates an arena and resolves lab-frame panels.
    ///
    /// # Errors
    /// Returns `InvalidHierarchy` for dangling or self parents, parents that
    /// are panels, cycles, groups without children or an arena without
    /// panels.
    pub fn from_nodes(nodes: Vec<DetectorNode>) -> Result<Self> {
        let n = nodes.len();
        let mut has_children = vec![false; n];
        for (index, node) in nodes.iter().enumerate() {
            let Some(parent) = node.parent() else {
                continue;
            };
            if parent >= n || parent == index {
                return Err(Error::InvalidHierarchy(format!(
                    "node {index} ({}) has invalid parent {parent}",
                    node.name()
                )));
            }
            if matches!(nodes[parent], DetectorNode::Panel { .. }) {
                return Err(Error::InvalidHierarchy(format!(
                    "node {index} ({}) has panel {parent} as parent",
                    node.name()
                )));
            }
            has_children[parent] = true;
        }

        for index in 0..n {
            let mut current = index;
            let mut steps = 0;
            while let Some(parent) = nodes[current].parent() {
                steps += 1;
                if steps > n {
                    return Err(Error::InvalidHierarchy(format!(
                        "cycle through node {index} ({})",
                        nodes[index].name()
                    )));
                }
                current = parent;
            }
        }

        for (index, node) in nodes.iter().enumerate() {
            if matches!(node, DetectorNode::Group { .. }) && !has_children[index] {
                return Err(Error::InvalidHierarchy(format!(
                    "group {index} ({}) has no children",
                    node.name()
                )));
            }
        }

        let panel_nodes: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| matches!(node, DetectorNode::Panel { .. }))
            .map(|(index, _)| index)
            .collect();
        if panel_nodes.is_empty() {
            return Err(Error::InvalidHierarchy(
                "detector has no panels".to_string(),
            ));
        }

        let panels = panel_nodes
            .iter()
            .map(|&index| Self::resolve(&nodes, index))
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Resolved detector with {} nodes and {} panels",
            nodes.len(),
            panels.len()
        );
        Ok(Self {
            nodes,
            panel_nodes,
            panels,
        })
    }

    fn resolve(nodes: &[DetectorNode], index: usize) -> Result<Panel> {
        let DetectorNode::Panel { panel, .. } = &nodes[index] else {
            return Err(Error::InvalidHierarchy(format!(
                "node {index} is not a panel"
            )));
        };
        let mut chain = vec![index];
        let mut current = index;
        while let Some(parent) = nodes[current].parent() {
            chain.push(parent);
            current = parent;
        }
        let frame = chain
            .iter()
            .rev()
            .fold(Frame::identity(), |acc, &node| acc.compose(&nodes[node].local_frame()));
        Ok(panel
            .clone()
            .with_frame(frame.origin, frame.fast_axis, frame.slow_axis))
    }

    /// Arena nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[DetectorNode] {
        &self.nodes
    }

    /// Indices of the direct children of a node.
    #[must_use]
    pub fn children(&self, node: usize) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent() == Some(node))
            .map(|(index, _)| index)
            .collect()
    }

    /// Indices of nodes without a parent.
    #[must_use]
    pub fn roots(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent().is_none())
            .map(|(index, _)| index)
            .collect()
    }

    /// Arena index of panel `panel`.
    #[must_use]
    pub fn panel_node(&self, panel: usize) -> Option<usize> {
        self.panel_nodes.get(panel).copied()
    }

    /// Lab-frame panels.
    #[must_use]
    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    #[must_use]
    pub fn num_panels(&self) -> usize {
        self.panels.len()
    }

    /// Lab-frame panel by index.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for an unknown panel.
    pub fn panel(&self, index: usize) -> Result<&Panel> {
        self.panels.get(index).ok_or_else(|| {
            Error::index_out_of_range(index as f64, 0, self.panels.len() as i64 - 1)
        })
    }

    /// First panel hit by the ray `s1`, with the panel-local position.
    ///
    /// # Errors
    /// Returns `OutOfBounds` if no panel is hit inside its bounds.
    pub fn ray_intersection(&self, s1: &Vec3) -> Result<(usize, MmPosition)> {
        for (index, panel) in self.panels.iter().enumerate() {
            if let Ok(mm) = panel.ray_intersection(s1) {
                let (wx, wy) = panel.image_size_mm();
                if (0.0..=wx).contains(&mm.0) && (0.0..=wy).contains(&mm.1) {
                    return Ok((index, mm));
                }
            }
        }
        Err(Error::OutOfBounds(format!(
            "ray {s1:?} does not hit any panel"
        )))
    }

    /// Smallest d-spacing (Å) seen at any panel corner.
    #[must_use]
    pub fn max_resolution(&self, s0: &Vec3) -> f64 {
        let wavelength = 1.0 / s0.norm();
        self.panels
            .iter()
            .flat_map(Panel::corners)
            .map(|corner| {
                let sin_theta = (s0.angle(&corner) / 2.0).sin();
                if sin_theta > 0.0 {
                    wavelength / (2.0 * sin_theta)
                } else {
                    f64::INFINITY
                }
            })
            .fold(f64::INFINITY, f64::min)
    }
}

/// Incremental construction of a detector arena.
#[derive(Debug, Clone, Default)]
pub struct DetectorBuilder {
    nodes: Vec<DetectorNode>,
}

impl DetectorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group node and returns its index.
    pub fn add_group(
        &mut self,
        name: impl Into<String>,
        frame: Frame,
        parent: Option<usize>,
    ) -> usize {
        self.nodes.push(DetectorNode::Group {
            name: name.into(),
            frame,
            parent,
        });
        self.nodes.len() - 1
    }

    /// Adds a panel node (frame relative to `parent`) and returns its index.
    pub fn add_panel(&mut self, panel: Panel, parent: Option<usize>) -> usize {
        self.nodes.push(DetectorNode::Panel { panel, parent });
        self.nodes.len() - 1
    }

    /// Re-parents an existing node.
    pub fn set_parent(&mut self, node: usize, new_parent: Option<usize>) {
        if let Some(DetectorNode::Group { parent, .. } | DetectorNode::Panel { parent, .. }) =
            self.nodes.get_mut(node)
        {
            *parent = new_parent;
        }
    }

    /// Validates the arena.
    ///
    /// # Errors
    /// See [`Detector::from_nodes`].
    pub fn build(self) -> Result<Detector> {
        Detector::from_nodes(self.nodes)
    }
}

/// Convenience constructors for common detector layouts.
pub struct DetectorFactory;

impl DetectorFactory {
    /// Single flat panel perpendicular to the beam at `distance` mm along
    /// `-z`, with the beam hitting panel position `beam_centre` (mm).
    ///
    /// # Errors
    /// Returns `InvalidModel` for unparsable or non-orthogonal axis labels
    /// and invalid panel parameters.
    pub fn simple(
        distance: f64,
        beam_centre: (f64, f64),
        fast_direction: &str,
        slow_direction: &str,
        pixel_size: (f64, f64),
        image_size: (usize, usize),
        trusted_range: (f64, f64),
    ) -> Result<Detector> {
        let fast = parse_axis_direction(fast_direction)?;
        let slow = parse_axis_direction(slow_direction)?;
        let origin = Vec3::new(0.0, 0.0, -distance) - fast * beam_centre.0 - slow * beam_centre.1;
        let panel = Panel::new("Panel", origin, fast, slow, pixel_size, image_size)?
            .with_type("SENSOR_UNKNOWN")
            .with_trusted_range(trusted_range.0, trusted_range.1)?;
        Ok(Detector::new(panel))
    }
}
