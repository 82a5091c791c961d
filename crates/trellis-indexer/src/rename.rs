//! Rename detection: content similarity and greedy one-to-one correlation

use std::sync::Arc;

use trellis_core::NodeType;
use trellis_core::config::RenameConfig;

/// Scores how alike two source spans are, from 0.0 (unrelated) to 1.0 (identical).
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Line based ratio `2 * matched / (len(a) + len(b))` over the longest common
/// subsequence of trimmed lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineSimilarity;

/// Above this many cell comparisons the quadratic LCS is replaced by a line multiset overlap.
const LCS_CELL_LIMIT: usize = 4_000_000;

impl SimilarityScorer for LineSimilarity {
    fn score(&self, a: &str, b: &str) -> f64 {
        let left: Vec<&str> = a.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let right: Vec<&str> = b.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let total = left.len() + right.len();
        if total == 0 {
            return if a.trim() == b.trim() { 1.0 } else { 0.0 };
        }
        let matched = if left.len() * right.len() > LCS_CELL_LIMIT {
            multiset_overlap(&left, &right)
        } else {
            lcs_len(&left, &right)
        };
        (2 * matched) as f64 / total as f64
    }
}

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            row[j + 1] = if x == y {
                prev[j] + 1
            } else {
                row[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn multiset_overlap(a: &[&str], b: &[&str]) -> usize {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for line in a {
        *counts.entry(line).or_default() += 1;
    }
    b.iter()
        .filter(|line| match counts.get_mut(*line) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        })
        .count()
}

/// One side of a potential rename.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub node_type: &'a NodeType,
    pub qualified_name: &'a str,
    /// Source text of the node's span.
    pub body: &'a str,
}

/// A removal candidate (index into the removed list) paired with a creation candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenameMatch {
    pub removed: usize,
    pub created: usize,
    pub score: f64,
}

/// Correlates disappearing nodes with appearing ones.
#[derive(Clone)]
pub struct RenameDetector {
    threshold: f64,
    match_qualified_name: bool,
    scorer: Arc<dyn SimilarityScorer>,
}

impl RenameDetector {
    pub fn new(config: &RenameConfig) -> Self {
        RenameDetector {
            threshold: config.similarity_threshold,
            match_qualified_name: config.match_qualified_name,
            scorer: Arc::new(LineSimilarity),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Greedy one-to-one matching.
    ///
    /// Pairs must share a node type. Equal qualified names match first,
    /// then the remaining pairs in descending similarity as long as the
    /// score reaches the threshold. Ties fall back to candidate order.
    pub fn correlate(&self, removed: &[Candidate<'_>], created: &[Candidate<'_>]) -> Vec<RenameMatch> {
        let mut pairs: Vec<(bool, RenameMatch)> = Vec::new();
        for (r, old) in removed.iter().enumerate() {
            for (c, new) in created.iter().enumerate() {
                if old.node_type != new.node_type {
                    continue;
                }
                let same_name = self.match_qualified_name && old.qualified_name == new.qualified_name;
                let score = self.scorer.score(old.body, new.body);
                if same_name || score >= self.threshold {
                    pairs.push((same_name, RenameMatch { removed: r, created: c, score }));
                }
            }
        }
        pairs.sort_by(|(a_same, a), (b_same, b)| {
            b_same
                .cmp(a_same)
                .then(b.score.total_cmp(&a.score))
                .then(a.removed.cmp(&b.removed))
                .then(a.created.cmp(&b.created))
        });

        let mut used_removed = vec![false; removed.len()];
        let mut used_created = vec![false; created.len()];
        let mut matches = Vec::new();
        for (_, pair) in pairs {
            if used_removed[pair.removed] || used_created[pair.created] {
                continue;
            }
            used_removed[pair.removed] = true;
            used_created[pair.created] = true;
            matches.push(pair);
        }
        matches
    }
}

/// Lines `start..=end` (one-based) of `source`.
pub fn span_text(source: &str, start_line: u32, end_line: u32) -> String {
    if start_line == 0 {
        return String::new();
    }
    source
        .lines()
        .skip(start_line as usize - 1)
        .take((end_line.saturating_sub(start_line) + 1) as usize)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: f64) -> RenameDetector {
        RenameDetector::new(&RenameConfig {
            similarity_threshold: threshold,
            ..Default::default()
        })
    }

    const ORIGINAL: &str = "def load(path):\n    with open(path) as f:\n        data = f.read()\n    return parse(data)\n";

    #[test]
    fn test_line_similarity() {
        let scorer = LineSimilarity;
        assert_eq!(scorer.score(ORIGINAL, ORIGINAL), 1.0);
        let renamed = ORIGINAL.replace("def load", "def read_config");
        assert_eq!(scorer.score(ORIGINAL, &renamed), 0.75);
        assert_eq!(scorer.score("a\nb\n", "c\nd\n"), 0.0);
        assert_eq!(scorer.score("", ""), 1.0);
    }

    #[test]
    fn test_correlate_prefers_equal_names_then_score() {
        let function = NodeType::Function;
        let renamed = ORIGINAL.replace("def load", "def read_config");
        let removed = vec![
            Candidate { node_type: &function, qualified_name: "a.load", body: ORIGINAL },
            Candidate { node_type: &function, qualified_name: "a.util", body: "def util():\n    pass\n" },
        ];
        let created = vec![
            Candidate { node_type: &function, qualified_name: "b.util", body: "def util():\n    return 1\n" },
            Candidate { node_type: &function, qualified_name: "b.read_config", body: &renamed },
            Candidate { node_type: &function, qualified_name: "a.util", body: "def util(x):\n    return x\n" },
        ];

        let matches = detector(0.7).correlate(&removed, &created);
        assert_eq!(matches.len(), 2);
        assert_eq!((matches[0].removed, matches[0].created), (1, 2));
        assert_eq!((matches[1].removed, matches[1].created), (0, 1));
    }

    #[test]
    fn test_correlate_respects_type_and_threshold() {
        let function = NodeType::Function;
        let class = NodeType::Class;
        let removed = vec![Candidate { node_type: &class, qualified_name: "a.Load", body: ORIGINAL }];
        let created = vec![Candidate { node_type: &function, qualified_name: "a.load", body: ORIGINAL }];
        assert!(detector(0.5).correlate(&removed, &created).is_empty());

        let removed = vec![Candidate { node_type: &function, qualified_name: "a.x", body: "1\n2\n3\n4\n" }];
        let created = vec![Candidate { node_type: &function, qualified_name: "a.y", body: "1\n2\n5\n6\n" }];
        assert!(detector(0.7).correlate(&removed, &created).is_empty());
        assert_eq!(detector(0.5).correlate(&removed, &created).len(), 1);
    }

    #[test]
    fn test_span_text() {
        assert_eq!(span_text("a\nb\nc\nd\n", 2, 3), "b\nc");
        assert_eq!(span_text("a\nb\n", 0, 0), "");
    }
}
