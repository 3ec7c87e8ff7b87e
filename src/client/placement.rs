//! Where the editor drops a node added from the toolbar.

use crate::models::{Node, NodeKind, Position};

/// Vertical distance between consecutive topics on the spine.
pub const TOPIC_Y: f64 = 200.0;
/// Horizontal offset of topics that alternate around the spine.
pub const TOPIC_X: f64 = 200.0;
/// Vertical distance between stacked subtopics.
pub const SUBTOPIC_Y: f64 = 50.0;
/// Horizontal offset of a subtopic from its topic.
pub const SUBTOPIC_X: f64 = 200.0;

/// Position for a new node of `kind`, given the live nodes in order.
///
/// Topics alternate left and right of the spine below the previous topic.
/// A subtopic right after a topic goes beside it, on the side away from the
/// spine; later subtopics stack under the previous node.
pub fn next_position(kind: NodeKind, nodes: &[Node]) -> Position {
    match kind {
        NodeKind::Topic => {
            let topics: Vec<&Node> = nodes.iter().filter(|n| n.kind() == NodeKind::Topic).collect();
            match topics.last() {
                None => Position::new(0.0, 0.0),
                Some(last) => {
                    let x = if topics.len() % 2 == 0 { -TOPIC_X } else { TOPIC_X };
                    Position::new(x, last.position.y + TOPIC_Y)
                }
            }
        }
        NodeKind::Subtopic => match nodes.last() {
            None => Position::new(0.0, 0.0),
            Some(last) if last.kind() == NodeKind::Topic => {
                let topic_count = nodes.iter().filter(|n| n.kind() == NodeKind::Topic).count();
                let dx = if topic_count % 2 == 0 { SUBTOPIC_X } else { -SUBTOPIC_X };
                Position::new(last.position.x + dx, last.position.y - SUBTOPIC_Y)
            }
            Some(last) => Position::new(last.position.x, last.position.y + SUBTOPIC_Y),
        },
        NodeKind::Start | NodeKind::Custom => Position::new(0.0, 0.0),
    }
}
