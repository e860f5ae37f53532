use std::collections::HashMap;

/// Disjoint sets over string ids, stored as a dense-index arena with path
/// compression and union by rank.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
    ids: Vec<String>,
    index: HashMap<String, u32>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Index of `id`, adding it as a singleton if unseen.
    pub fn insert(&mut self, id: &str) -> u32 {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.ids.len() as u32;
        self.parent.push(i);
        self.rank.push(0);
        self.ids.push(id.to_string());
        self.index.insert(id.to_string(), i);
        i
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            self.parent[x as usize] = self.parent[self.parent[x as usize] as usize];
            x = self.parent[x as usize];
        }
        x
    }

    /// Links the sets of `a` and `b`, adding either id when unseen.
    pub fn union(&mut self, a: &str, b: &str) {
        let a = self.insert(a);
        let b = self.insert(b);
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            std::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
    }

    pub fn same_set(&mut self, a: &str, b: &str) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(a), Some(b)) => self.find(a) == self.find(b),
            _ => false,
        }
    }

    /// All sets, each in insertion order, ordered by their first member.
    pub fn groups(&mut self) -> Vec<Vec<String>> {
        let mut slot_of_root: HashMap<u32, usize> = HashMap::new();
        let mut groups: Vec<Vec<String>> = Vec::new();
        for i in 0..self.ids.len() as u32 {
            let root = self.find(i);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(self.ids[i as usize].clone());
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_cases() {
        let mut uf = UnionFind::new();
        uf.union("a", "b"); // neither known
        uf.union("b", "c"); // one known
        uf.union("d", "e");
        uf.insert("f");
        assert!(uf.same_set("a", "c"));
        assert!(!uf.same_set("a", "d"));
        uf.union("c", "e"); // both known
        assert!(uf.same_set("a", "d"));
        assert!(!uf.same_set("a", "zzz"));
        assert_eq!(uf.len(), 6);
        assert_eq!(
            uf.groups(),
            vec![
                vec!["a", "b", "c", "d", "e"],
                vec!["f"],
            ]
        );
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut uf = UnionFind::new();
        assert_eq!(uf.insert("x"), 0);
        assert_eq!(uf.insert("y"), 1);
        assert_eq!(uf.insert("x"), 0);
        uf.union("x", "x");
        assert_eq!(uf.groups(), vec![vec!["x"], vec!["y"]]);
        assert!(uf.contains("y"));
    }
}
