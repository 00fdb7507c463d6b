//! The match record produced by every finder.

/// A rectangle in haystack coordinates with the similarity it was matched at
/// and the click offset carried over from the needle.
///
/// Matches are produced ordered best first and never mutated by the finder
/// after return; an enclosing region may translate the location when the
/// haystack was a sub-region of the screen.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Offset from the region center toward the click target.
    pub dx: i32,
    pub dy: i32,
    /// Attained similarity in [0, 1].
    pub similarity: f64,
}

impl Match {
    pub fn new(x: i32, y: i32, width: u32, height: u32, dx: i32, dy: i32, similarity: f64) -> Match {
        Match {
            x,
            y,
            width,
            height,
            dx,
            dy,
            similarity,
        }
    }

    /// The point to click: region center displaced by the needle offset.
    pub fn target(&self) -> (i32, i32) {
        (
            self.x + self.width as i32 / 2 + self.dx,
            self.y + self.height as i32 / 2 + self.dy,
        )
    }
}

impl std::fmt::Display for Match {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}+{}+{} at {:.4}",
            self.width, self.height, self.x, self.y, self.similarity
        )
    }
}

/// Order matches best first by descending similarity.
pub fn sort_best_first(matches: &mut [Match]) {
    matches.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_target_combines_center_and_offset() {
        let m = Match::new(10, 20, 30, 40, 5, -5, 1.0);
        assert_eq!(m.target(), (10 + 15 + 5, 20 + 20 - 5));
    }

    #[test]
    fn sorting_is_descending_by_similarity() {
        let mut matches = vec![
            Match::new(0, 0, 1, 1, 0, 0, 0.2),
            Match::new(0, 0, 1, 1, 0, 0, 0.9),
            Match::new(0, 0, 1, 1, 0, 0, 0.5),
        ];
        sort_best_first(&mut matches);
        let sims: Vec<f64> = matches.iter().map(|m| m.similarity).collect();
        assert_eq!(sims, vec![0.9, 0.5, 0.2]);
    }
}
