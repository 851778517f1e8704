use std::collections::HashMap;

/// Match kind carried by a trie node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    None,
    Full,
    Suffix,
}

/// Domain trie for full/suffix matching.
///
/// Keyed by the final label: "www.example.com" walks com → example → www.
/// A `suffix` node matches the domain itself and every subdomain on label
/// boundaries; a `full` node matches the exact domain only.
pub struct DomainTrie {
    root: HashMap<String, Node>,
}

struct Node {
    kind: MatchKind,
    children: HashMap<String, Node>,
}

impl Node {
    fn new() -> Self {
        Self {
            kind: MatchKind::None,
            children: HashMap::new(),
        }
    }
}

impl DomainTrie {
    pub fn new() -> Self {
        Self {
            root: HashMap::new(),
        }
    }

    pub fn insert_full(&mut self, domain: &str) {
        self.insert(domain, MatchKind::Full);
    }

    pub fn insert_suffix(&mut self, domain: &str) {
        self.insert(domain, MatchKind::Suffix);
    }

    fn insert(&mut self, domain: &str, kind: MatchKind) {
        let domain = domain.to_ascii_lowercase();
        let labels: Vec<&str> = domain.split('.').collect();
        let mut map = &mut self.root;
        for label in labels[1..].iter().rev() {
            let node = map.entry(label.to_string()).or_insert_with(Node::new);
            if node.kind == MatchKind::Suffix {
                // an ancestor suffix rule already subsumes the new one
                return;
            }
            map = &mut node.children;
        }

        let leaf = map.entry(labels[0].to_string()).or_insert_with(Node::new);
        if leaf.kind != MatchKind::Suffix {
            leaf.kind = kind;
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let mut map = &self.root;
        let mut last_kind = MatchKind::None;
        for label in domain.split('.').rev() {
            let node = match map.get(label) {
                Some(node) => node,
                None => return false,
            };
            if node.kind == MatchKind::Suffix {
                return true;
            }
            last_kind = node.kind;
            map = &node.children;
        }
        last_kind == MatchKind::Full
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_matches_domain_and_subdomains() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("example.com");

        assert!(trie.matches("example.com"));
        assert!(trie.matches("www.example.com"));
        assert!(trie.matches("a.b.example.com"));
        assert!(!trie.matches("example.org"));
    }

    #[test]
    fn full_matches_exactly() {
        let mut trie = DomainTrie::new();
        trie.insert_full("example.com");

        assert!(trie.matches("example.com"));
        assert!(!trie.matches("www.example.com"));
        assert!(!trie.matches("com"));
    }

    #[test]
    fn label_boundaries_respected() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("example.com");

        assert!(!trie.matches("notexample.com"));
        assert!(!trie.matches("example.com.evil.org"));
    }

    #[test]
    fn case_insensitive() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("Example.COM");

        assert!(trie.matches("example.com"));
        assert!(trie.matches("WWW.EXAMPLE.COM"));
    }

    #[test]
    fn single_label() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("cn");

        assert!(trie.matches("cn"));
        assert!(trie.matches("example.cn"));
        assert!(!trie.matches("cnn.com"));
    }

    #[test]
    fn suffix_shadows_later_full() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("example.com");
        trie.insert_full("a.example.com");

        // the descendant full rule adds nothing over the suffix
        assert!(trie.matches("a.example.com"));
        assert!(trie.matches("b.a.example.com"));
    }

    #[test]
    fn suffix_not_downgraded_by_full() {
        let mut trie = DomainTrie::new();
        trie.insert_suffix("example.com");
        trie.insert_full("example.com");

        assert!(trie.matches("www.example.com"));
    }

    #[test]
    fn full_upgraded_to_suffix() {
        let mut trie = DomainTrie::new();
        trie.insert_full("example.com");
        trie.insert_suffix("example.com");

        assert!(trie.matches("www.example.com"));
    }

    #[test]
    fn insertion_order_independent() {
        let mut a = DomainTrie::new();
        a.insert_full("a.example.com");
        a.insert_suffix("example.com");

        let mut b = DomainTrie::new();
        b.insert_suffix("example.com");
        b.insert_full("a.example.com");

        for domain in ["example.com", "a.example.com", "x.a.example.com", "other.org"] {
            assert_eq!(a.matches(domain), b.matches(domain), "domain {}", domain);
        }
    }

    #[test]
    fn sibling_rules_coexist() {
        let mut trie = DomainTrie::new();
        trie.insert_full("a.example.com");
        trie.insert_suffix("b.example.com");

        assert!(trie.matches("a.example.com"));
        assert!(!trie.matches("x.a.example.com"));
        assert!(trie.matches("x.b.example.com"));
        assert!(!trie.matches("example.com"));
    }
}
