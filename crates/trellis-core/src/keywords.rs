//! Keyword index for node search

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::NodeId;

/// Split identifiers and paths into lowercase search tokens.
///
/// Boundaries are any non-alphanumeric character plus lower-to-upper
/// camel case transitions, so `getUserById` and `get_user_by_id` both
/// yield `get user by id`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            flush(&mut current, &mut tokens);
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            flush(&mut current, &mut tokens);
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    flush(&mut current, &mut tokens);
    tokens
}

fn flush(current: &mut String, tokens: &mut Vec<String>) {
    if !current.is_empty() {
        let token = std::mem::take(current);
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
}

/// Maps tokens to the nodes whose name, qualified name or file path contain them.
#[derive(Debug, Default, Clone)]
pub struct KeywordIndex {
    tokens: BTreeMap<String, BTreeSet<NodeId>>,
    by_node: HashMap<NodeId, Vec<String>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a node under every token of the given texts, replacing earlier entries.
    pub fn insert<'a>(&mut self, id: &NodeId, texts: impl IntoIterator<Item = &'a str>) {
        self.remove(id);
        let mut node_tokens: Vec<String> = Vec::new();
        for text in texts {
            for token in tokenize(text) {
                if !node_tokens.contains(&token) {
                    node_tokens.push(token);
                }
            }
        }
        for token in &node_tokens {
            self.tokens.entry(token.clone()).or_default().insert(id.clone());
        }
        self.by_node.insert(id.clone(), node_tokens);
    }

    pub fn remove(&mut self, id: &NodeId) {
        let Some(node_tokens) = self.by_node.remove(id) else {
            return;
        };
        for token in node_tokens {
            if let Some(ids) = self.tokens.get_mut(&token) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tokens.remove(&token);
                }
            }
        }
    }

    /// Nodes matching every token of `query`, each query token matched as a prefix.
    pub fn lookup(&self, query: &str) -> BTreeSet<NodeId> {
        let query_tokens = tokenize(query);
        let mut result: Option<BTreeSet<NodeId>> = None;

        for token in &query_tokens {
            let matches: BTreeSet<NodeId> = self
                .tokens
                .range(token.clone()..)
                .take_while(|(indexed, _)| indexed.starts_with(token.as_str()))
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect();
            result = Some(match result {
                None => matches,
                Some(acc) => acc.intersection(&matches).cloned().collect(),
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }

        result.unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_identifiers() {
        insta::assert_snapshot!(tokenize("getUserById").join(" "), @"get user by id");
        insta::assert_snapshot!(tokenize("pkg.auth.check_token").join(" "), @"pkg auth check token");
        assert_eq!(tokenize("HTTPServer"), vec!["httpserver"]);
        assert!(tokenize("__").is_empty());
    }

    #[test]
    fn test_lookup_requires_every_token() {
        let mut index = KeywordIndex::new();
        let login = NodeId::from("function:auth.login_user");
        let logout = NodeId::from("function:auth.logout_user");
        index.insert(&login, ["login_user", "auth.login_user"]);
        index.insert(&logout, ["logout_user", "auth.logout_user"]);

        assert_eq!(index.lookup("user").len(), 2);
        assert_eq!(index.lookup("login user").into_iter().collect::<Vec<_>>(), vec![login.clone()]);
        assert_eq!(index.lookup("log").len(), 2);
        assert!(index.lookup("missing").is_empty());

        index.remove(&login);
        assert_eq!(index.lookup("user").into_iter().collect::<Vec<_>>(), vec![logout]);
        assert_eq!(index.len(), 1);
    }
}
