/// Process diagram rendering
///
/// Draws a deployed process as an image, highlighting the nodes where live
/// instances are currently parked. The built-in renderer produces SVG with a
/// simple layered layout: nodes are placed in columns by their BFS distance
/// from the start event.

use crate::process::graph::ProcessGraph;
use crate::process::types::{Node, NodeKind};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Turns a process graph into image bytes
pub trait DiagramRenderer: Send + Sync {
    /// MIME type of the rendered bytes
    fn content_type(&self) -> &'static str;

    /// Render `graph`, highlighting `active` node ids
    fn render(&self, graph: &ProcessGraph, active: &[String]) -> anyhow::Result<Vec<u8>>;
}

const COLUMN_WIDTH: f64 = 180.0;
const ROW_HEIGHT: f64 = 110.0;
const MARGIN: f64 = 60.0;
const TASK_WIDTH: f64 = 120.0;
const TASK_HEIGHT: f64 = 60.0;
const EVENT_RADIUS: f64 = 18.0;
const GATEWAY_HALF: f64 = 25.0;

const STROKE: &str = "#333333";
const ACTIVE_STROKE: &str = "#e53935";

/// SVG renderer with a BFS layer layout
#[derive(Debug, Clone)]
pub struct SvgDiagramRenderer {
    font_family: String,
}

impl SvgDiagramRenderer {
    pub fn new(font_family: impl Into<String>) -> Self {
        Self {
            font_family: font_family.into(),
        }
    }
}

impl Default for SvgDiagramRenderer {
    fn default() -> Self {
        Self::new("SimSun")
    }
}

impl DiagramRenderer for SvgDiagramRenderer {
    fn content_type(&self) -> &'static str {
        "image/svg+xml"
    }

    fn render(&self, graph: &ProcessGraph, active: &[String]) -> anyhow::Result<Vec<u8>> {
        let active: HashSet<&str> = active.iter().map(String::as_str).collect();
        let layers = graph.layers();

        let mut positions: HashMap<&str, (f64, f64)> = HashMap::new();
        let mut max_rows = 1usize;
        for (column, layer) in layers.iter().enumerate() {
            max_rows = max_rows.max(layer.len());
            for (row, node) in layer.iter().enumerate() {
                let x = MARGIN + column as f64 * COLUMN_WIDTH + TASK_WIDTH / 2.0;
                let y = MARGIN + row as f64 * ROW_HEIGHT + TASK_HEIGHT / 2.0;
                positions.insert(node.id.as_str(), (x, y));
            }
        }

        let width = MARGIN * 2.0 + layers.len().max(1) as f64 * COLUMN_WIDTH;
        let height = MARGIN * 2.0 + max_rows as f64 * ROW_HEIGHT;

        let mut svg = String::new();
        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="{font}" font-size="12">"#,
            w = width,
            h = height,
            font = escape_xml(&self.font_family)
        )?;
        writeln!(
            svg,
            r#"<defs><marker id="arrow" viewBox="0 0 10 10" refX="10" refY="5" markerWidth="8" markerHeight="8" orient="auto-start-reverse"><path d="M 0 0 L 10 5 L 0 10 z" fill="{}"/></marker></defs>"#,
            STROKE
        )?;

        for flow in graph.flows() {
            let (Some(&(x1, y1)), Some(&(x2, y2))) = (
                positions.get(flow.source.as_str()),
                positions.get(flow.target.as_str()),
            ) else {
                continue;
            };
            writeln!(
                svg,
                r#"<line id="{}" x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" marker-end="url(#arrow)"/>"#,
                escape_xml(&flow.id),
                x1,
                y1,
                x2,
                y2,
                STROKE
            )?;
            if let Some(condition) = &flow.condition {
                writeln!(
                    svg,
                    r##"<text x="{:.1}" y="{:.1}" text-anchor="middle" fill="#555555">{}</text>"##,
                    (x1 + x2) / 2.0,
                    (y1 + y2) / 2.0 - 6.0,
                    escape_xml(condition)
                )?;
            }
        }

        for node in graph.nodes() {
            let Some(&(x, y)) = positions.get(node.id.as_str()) else {
                continue;
            };
            let stroke = if active.contains(node.id.as_str()) {
                ACTIVE_STROKE
            } else {
                STROKE
            };
            draw_node(&mut svg, node, x, y, stroke)?;
        }

        svg.push_str("</svg>\n");
        Ok(svg.into_bytes())
    }
}

fn draw_node(svg: &mut String, node: &Node, x: f64, y: f64, stroke: &str) -> std::fmt::Result {
    let id = escape_xml(&node.id);
    let label = escape_xml(node.display_name());
    let stroke_width = if stroke == ACTIVE_STROKE { 3 } else { 1 };

    match &node.kind {
        NodeKind::StartEvent | NodeKind::EndEvent => {
            let width = if matches!(node.kind, NodeKind::EndEvent) {
                stroke_width + 2
            } else {
                stroke_width
            };
            writeln!(
                svg,
                r#"<circle id="{}" cx="{:.1}" cy="{:.1}" r="{}" fill="white" stroke="{}" stroke-width="{}"/>"#,
                id, x, y, EVENT_RADIUS, stroke, width
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
                x,
                y + EVENT_RADIUS + 14.0,
                label
            )
        }
        NodeKind::UserTask { .. } | NodeKind::ServiceTask { .. } => {
            writeln!(
                svg,
                r#"<rect id="{}" x="{:.1}" y="{:.1}" width="{}" height="{}" rx="10" fill="white" stroke="{}" stroke-width="{}"/>"#,
                id,
                x - TASK_WIDTH / 2.0,
                y - TASK_HEIGHT / 2.0,
                TASK_WIDTH,
                TASK_HEIGHT,
                stroke,
                stroke_width
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" dominant-baseline="middle">{}</text>"#,
                x, y, label
            )
        }
        NodeKind::ExclusiveGateway { .. } => {
            writeln!(
                svg,
                r#"<polygon id="{}" points="{:.1},{:.1} {:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="white" stroke="{}" stroke-width="{}"/>"#,
                id,
                x,
                y - GATEWAY_HALF,
                x + GATEWAY_HALF,
                y,
                x,
                y + GATEWAY_HALF,
                x - GATEWAY_HALF,
                y,
                stroke,
                stroke_width
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
                x,
                y + GATEWAY_HALF + 14.0,
                label
            )
        }
    }
}

/// Escape XML special characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::ProcessModel;
    use serde_json::json;

    fn graph() -> ProcessGraph {
        let model: ProcessModel = serde_json::from_value(json!({
            "key": "leave",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "approve", "type": "userTask", "name": "Approve <manager>"},
                {"id": "gw", "type": "exclusiveGateway"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "approve"},
                {"id": "f2", "source": "approve", "target": "gw"},
                {"id": "f3", "source": "gw", "target": "end", "condition": "${days < 5 && ok}"}
            ]
        }))
        .unwrap();
        ProcessGraph::build(&model).unwrap()
    }

    #[test]
    fn renders_every_node_and_flow() {
        let renderer = SvgDiagramRenderer::new("Noto Sans");
        let svg = String::from_utf8(renderer.render(&graph(), &[]).unwrap()).unwrap();

        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert!(svg.contains(r#"font-family="Noto Sans""#));
        for id in ["start", "approve", "gw", "end", "f1", "f2", "f3"] {
            assert!(svg.contains(&format!(r#"id="{}""#, id)), "missing {}", id);
        }
        assert_eq!(renderer.content_type(), "image/svg+xml");
    }

    #[test]
    fn labels_are_escaped() {
        let svg = String::from_utf8(SvgDiagramRenderer::default().render(&graph(), &[]).unwrap()).unwrap();
        assert!(svg.contains("Approve &lt;manager&gt;"));
        assert!(svg.contains("${days &lt; 5 &amp;&amp; ok}"));
    }

    #[test]
    fn active_nodes_are_highlighted() {
        let renderer = SvgDiagramRenderer::default();
        let idle = String::from_utf8(renderer.render(&graph(), &[]).unwrap()).unwrap();
        let busy = String::from_utf8(renderer.render(&graph(), &["approve".to_string()]).unwrap()).unwrap();

        assert!(!idle.contains(ACTIVE_STROKE));
        assert!(busy.contains(ACTIVE_STROKE));
    }
}
