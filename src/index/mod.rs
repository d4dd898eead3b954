//! In-memory triple index
//!
//! Terms are interned into a vocabulary of dense [`Id`]s. Every triple is
//! stored in three sorted permutations (SPO, POS, OSP) so that any pattern
//! with bound positions can be answered by one range scan plus a filter.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use parking_lot::RwLock;
use serde::Serialize;

pub type Id = u64;

/// Index error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("Could not read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permutation {
    Spo,
    Pos,
    Osp,
}

impl Permutation {
    /// Positions (0 = s, 1 = p, 2 = o) in key order
    fn order(self) -> [usize; 3] {
        match self {
            Permutation::Spo => [0, 1, 2],
            Permutation::Pos => [1, 2, 0],
            Permutation::Osp => [2, 0, 1],
        }
    }
}

/// Counts reported by `cmd=stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexStats {
    pub name_index: String,
    pub name_text_index: String,
    pub num_permutations: usize,
    pub num_triples: usize,
    pub num_subjects: usize,
    pub num_predicates: usize,
    pub num_objects: usize,
}

pub struct TripleIndex {
    vocabulary: Vec<String>,
    ids: HashMap<String, Id>,
    spo: Vec<[Id; 3]>,
    pos: Vec<[Id; 3]>,
    osp: Vec<[Id; 3]>,
    kb_name: RwLock<String>,
    text_name: RwLock<String>,
}

impl TripleIndex {
    pub fn empty() -> Self {
        Self::from_triples(std::iter::empty::<(String, String, String)>())
    }

    /// Build from triples of terms in N-Triples spelling
    pub fn from_triples<S, I>(triples: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, S, S)>,
    {
        let mut builder = IndexBuilder::default();
        for (s, p, o) in triples {
            builder.add(s.as_ref(), p.as_ref(), o.as_ref());
        }
        builder.build()
    }

    /// Load an N-Triples style file: one `<s> <p> <o> .` per line,
    /// `#` comments and blank lines are skipped
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let io_error = |e: std::io::Error| IndexError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let file = std::fs::File::open(path).map_err(io_error)?;
        let reader = std::io::BufReader::new(file);
        let mut builder = IndexBuilder::default();
        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(io_error)?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let [s, p, o] = parse_ntriples_line(trimmed).map_err(|message| IndexError::Parse {
                line: number + 1,
                message,
            })?;
            builder.add(&s, &p, &o);
        }
        let index = builder.build();
        tracing::info!(
            path = %path.display(),
            num_triples = index.num_triples(),
            vocabulary_size = index.vocabulary.len(),
            "index_loaded"
        );
        Ok(index)
    }

    pub fn get_id(&self, term: &str) -> Option<Id> {
        self.ids.get(term).copied()
    }

    pub fn get_term(&self, id: Id) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.vocabulary.get(i))
            .map(String::as_str)
    }

    pub fn num_triples(&self) -> usize {
        self.spo.len()
    }

    /// Triples (in s, p, o order) matching the bound positions
    pub fn scan(
        &self,
        subject: Option<Id>,
        predicate: Option<Id>,
        object: Option<Id>,
    ) -> impl Iterator<Item = [Id; 3]> + '_ {
        let bound = [subject, predicate, object];
        let permutation = match bound {
            [Some(_), _, None] | [Some(_), Some(_), Some(_)] | [None, None, None] => {
                Permutation::Spo
            }
            [None, Some(_), _] => Permutation::Pos,
            [_, None, Some(_)] => Permutation::Osp,
        };
        let order = permutation.order();
        let table = match permutation {
            Permutation::Spo => &self.spo,
            Permutation::Pos => &self.pos,
            Permutation::Osp => &self.osp,
        };

        // Longest prefix of bound positions in key order
        let prefix: Vec<Id> = order
            .iter()
            .map_while(|&position| bound[position])
            .collect();
        let start = table.partition_point(|key| key[..prefix.len()] < prefix[..]);
        let end = table.partition_point(|key| key[..prefix.len()] <= prefix[..]);

        table[start..end].iter().filter_map(move |key| {
            let mut triple = [0; 3];
            for (slot, &position) in order.iter().enumerate() {
                triple[position] = key[slot];
            }
            let matches = bound
                .iter()
                .zip(triple.iter())
                .all(|(b, t)| b.map_or(true, |b| b == *t));
            matches.then_some(triple)
        })
    }

    /// Number of triples per distinct predicate, sorted by predicate id
    pub fn predicate_counts(&self) -> Vec<(Id, usize)> {
        let mut counts: Vec<(Id, usize)> = Vec::new();
        for key in &self.pos {
            match counts.last_mut() {
                Some((predicate, count)) if *predicate == key[0] => *count += 1,
                _ => counts.push((key[0], 1)),
            }
        }
        counts
    }

    fn count_distinct(table: &[[Id; 3]]) -> usize {
        let mut count = 0;
        let mut last = None;
        for key in table {
            if last != Some(key[0]) {
                count += 1;
                last = Some(key[0]);
            }
        }
        count
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            name_index: self.kb_name(),
            name_text_index: self.text_name(),
            num_permutations: 3,
            num_triples: self.num_triples(),
            num_subjects: Self::count_distinct(&self.spo),
            num_predicates: Self::count_distinct(&self.pos),
            num_objects: Self::count_distinct(&self.osp),
        }
    }

    pub fn kb_name(&self) -> String {
        self.kb_name.read().clone()
    }

    pub fn set_kb_name(&self, name: &str) {
        *self.kb_name.write() = name.to_string();
    }

    pub fn text_name(&self) -> String {
        self.text_name.read().clone()
    }

    pub fn set_text_name(&self, name: &str) {
        *self.text_name.write() = name.to_string();
    }
}

#[derive(Default)]
struct IndexBuilder {
    vocabulary: Vec<String>,
    ids: HashMap<String, Id>,
    spo: Vec<[Id; 3]>,
}

impl IndexBuilder {
    fn intern(&mut self, term: &str) -> Id {
        if let Some(&id) = self.ids.get(term) {
            return id;
        }
        let id = self.vocabulary.len() as Id;
        self.vocabulary.push(term.to_string());
        self.ids.insert(term.to_string(), id);
        id
    }

    fn add(&mut self, s: &str, p: &str, o: &str) {
        let triple = [self.intern(s), self.intern(p), self.intern(o)];
        self.spo.push(triple);
    }

    fn build(mut self) -> TripleIndex {
        self.spo.sort_unstable();
        self.spo.dedup();
        let mut pos: Vec<[Id; 3]> = self.spo.iter().map(|&[s, p, o]| [p, o, s]).collect();
        pos.sort_unstable();
        let mut osp: Vec<[Id; 3]> = self.spo.iter().map(|&[s, p, o]| [o, s, p]).collect();
        osp.sort_unstable();
        TripleIndex {
            vocabulary: self.vocabulary,
            ids: self.ids,
            spo: self.spo,
            pos,
            osp,
            kb_name: RwLock::new(String::new()),
            text_name: RwLock::new(String::new()),
        }
    }
}

/// Split one N-Triples statement into its three terms
fn parse_ntriples_line(line: &str) -> Result<[String; 3], String> {
    let mut rest = line;
    let mut terms = Vec::with_capacity(3);
    for _ in 0..3 {
        rest = rest.trim_start();
        let (term, remaining) = next_term(rest)?;
        terms.push(term.to_string());
        rest = remaining;
    }
    if rest.trim() != "." {
        return Err(format!("expected '.' after the object, found \"{}\"", rest.trim()));
    }
    let [s, p, o]: [String; 3] = terms
        .try_into()
        .map_err(|_| "expected three terms".to_string())?;
    Ok([s, p, o])
}

fn next_term(input: &str) -> Result<(&str, &str), String> {
    let end = if input.starts_with('<') {
        input
            .find('>')
            .map(|i| i + 1)
            .ok_or_else(|| "unterminated IRI".to_string())?
    } else if input.starts_with("_:") {
        input
            .find(|c: char| c.is_whitespace())
            .unwrap_or(input.len())
    } else if input.starts_with('"') {
        let mut escaped = false;
        let mut close = None;
        for (i, c) in input.char_indices().skip(1) {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => {
                    close = Some(i);
                    break;
                }
                _ => escaped = false,
            }
        }
        let close = close.ok_or_else(|| "unterminated literal".to_string())?;
        let after = &input[close + 1..];
        if after.starts_with('@') || after.starts_with("^^") {
            close
                + 1
                + after
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(after.len())
        } else {
            close + 1
        }
    } else {
        return Err(format!(
            "expected an IRI, blank node or literal at \"{}\"",
            input.chars().take(20).collect::<String>()
        ));
    };
    Ok(input.split_at(end))
}
