//! Unified diff parsing with changed lines mapped onto source blocks.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::MethodSignature;
use crate::syntax::{NodeId, SyntaxTree};

/// Pre- and post-patch syntax trees by repository-relative path.
pub trait SourceLookup {
    fn pre_tree(&self, path: &str) -> Option<&SyntaxTree>;
    fn post_tree(&self, path: &str) -> Option<&SyntaxTree>;
}

/// Lookup that knows no sources; every block reference stays empty.
pub struct NoSources;

impl SourceLookup for NoSources {
    fn pre_tree(&self, _path: &str) -> Option<&SyntaxTree> {
        None
    }

    fn post_tree(&self, _path: &str) -> Option<&SyntaxTree> {
        None
    }
}

/// Source trees on both sides of a patch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePair {
    #[serde(default)]
    pub pre: BTreeMap<String, SyntaxTree>,
    #[serde(default)]
    pub post: BTreeMap<String, SyntaxTree>,
}

impl SourceLookup for SourcePair {
    fn pre_tree(&self, path: &str) -> Option<&SyntaxTree> {
        self.pre.get(path)
    }

    fn post_tree(&self, path: &str) -> Option<&SyntaxTree> {
        self.post.get(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Addition,
    Deletion,
    Modification,
}

/// Smallest enclosing scope of a change in either tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub pre: Option<NodeId>,
    pub post: Option<NodeId>,
    /// Label shared by corresponding scopes of the pre and post trees.
    pub label: Option<String>,
    pub method: Option<MethodSignature>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDiff {
    pub kind: ChangeKind,
    pub block: BlockRef,
    /// Old-file line numbers removed.
    pub deleted: Vec<usize>,
    /// New-file line numbers added.
    pub added: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// `None` when the file is created by the patch.
    pub old_path: Option<String>,
    /// `None` when the file is deleted by the patch.
    pub new_path: Option<String>,
    pub old_revision: Option<String>,
    pub new_revision: Option<String>,
    pub hunks: Vec<Hunk>,
    pub blocks: Vec<BlockDiff>,
}

impl FileDiff {
    /// Post-patch path, or the pre-patch path for deleted files.
    pub fn path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    /// Methods touched by this file's changes, without duplicates.
    pub fn methods(&self) -> Vec<&MethodSignature> {
        let mut methods: Vec<&MethodSignature> = self
            .blocks
            .iter()
            .filter_map(|block| block.block.method.as_ref())
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }
}

/// Parse `text` into one result per file section.
pub fn parse_diff(text: &str, sources: &dyn SourceLookup) -> Vec<AnalysisResult<FileDiff>> {
    let sections = split_sections(text);
    let results: Vec<AnalysisResult<FileDiff>> = sections
        .into_iter()
        .map(|section| section.finish(sources))
        .collect();
    for result in &results {
        if let Err(error) = result {
            warn!("skipping diff file: {error}");
        }
    }
    debug!("parsed {} diff files", results.len());
    results
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Old,
    New,
}

#[derive(Clone, Copy, Debug)]
struct LineChange {
    side: Side,
    /// Line number in the old or new file.
    line: usize,
    /// Line of the diff text, for error reporting.
    diff_line: usize,
    /// Consecutive changed lines share a run.
    run: usize,
}

#[derive(Clone, Copy, Debug)]
struct OpenHunk {
    old_line: usize,
    new_line: usize,
    old_left: usize,
    new_left: usize,
}

impl OpenHunk {
    fn is_done(&self) -> bool {
        self.old_left == 0 && self.new_left == 0
    }
}

#[derive(Debug, Default)]
struct Section {
    first_line: usize,
    old_path: Option<String>,
    new_path: Option<String>,
    git_paths: Option<(String, String)>,
    old_revision: Option<String>,
    new_revision: Option<String>,
    saw_old_header: bool,
    hunks: Vec<Hunk>,
    changes: Vec<LineChange>,
    error: Option<AnalysisError>,
}

impl Section {
    fn starting_at(line: usize) -> Self {
        Self {
            first_line: line,
            ..Self::default()
        }
    }

    fn fail(&mut self, line: usize, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(AnalysisError::malformed_diff(line, reason));
        }
    }

    fn finish(self, sources: &dyn SourceLookup) -> AnalysisResult<FileDiff> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let (git_old, git_new) = match self.git_paths {
            Some((old, new)) => (Some(old), Some(new)),
            None => (None, None),
        };
        let old_path = if self.saw_old_header { self.old_path } else { git_old };
        let new_path = if self.saw_old_header { self.new_path } else { git_new };
        if old_path.is_none() && new_path.is_none() && !self.hunks.is_empty() {
            return Err(AnalysisError::malformed_diff(
                self.first_line,
                "hunks without file header",
            ));
        }

        let pre = old_path.as_deref().and_then(|path| sources.pre_tree(path));
        let post = new_path.as_deref().and_then(|path| sources.post_tree(path));
        let blocks = map_blocks(&self.changes, pre, post)?;
        Ok(FileDiff {
            old_path,
            new_path,
            old_revision: self.old_revision,
            new_revision: self.new_revision,
            hunks: self.hunks,
            blocks,
        })
    }
}

fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut hunk: Option<OpenHunk> = None;
    let mut run = 0;
    let mut in_run = false;

    for (index, line) in text.lines().enumerate() {
        let number = index + 1;

        if let Some(open) = hunk.as_mut() {
            let Some(section) = sections.last_mut() else {
                hunk = None;
                continue;
            };
            let change = match line.chars().next() {
                Some('\\') => continue,
                Some(' ') | None => {
                    if open.old_left == 0 || open.new_left == 0 {
                        section.fail(number, "context line beyond hunk range");
                        hunk = None;
                        continue;
                    }
                    open.old_line += 1;
                    open.new_line += 1;
                    open.old_left -= 1;
                    open.new_left -= 1;
                    in_run = false;
                    None
                }
                Some('-') if open.old_left > 0 => {
                    let change = (Side::Old, open.old_line);
                    open.old_line += 1;
                    open.old_left -= 1;
                    Some(change)
                }
                Some('+') if open.new_left > 0 => {
                    let change = (Side::New, open.new_line);
                    open.new_line += 1;
                    open.new_left -= 1;
                    Some(change)
                }
                _ => {
                    section.fail(number, "hunk body does not match its header counts");
                    hunk = None;
                    continue;
                }
            };
            if let Some((side, line)) = change {
                if !in_run {
                    run += 1;
                    in_run = true;
                }
                section.changes.push(LineChange {
                    side,
                    line,
                    diff_line: number,
                    run,
                });
            }
            if open.is_done() {
                hunk = None;
                in_run = false;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            let mut section = Section::starting_at(number);
            section.git_paths = git_header_paths(rest);
            sections.push(section);
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let reuse = sections
                .last()
                .is_some_and(|section| !section.saw_old_header && section.hunks.is_empty());
            if !reuse {
                sections.push(Section::starting_at(number));
            }
            if let Some(section) = sections.last_mut() {
                section.saw_old_header = true;
                section.old_path = header_path(rest);
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(section) = sections.last_mut() {
                section.new_path = header_path(rest);
            }
        } else if let Some(rest) = line.strip_prefix("index ") {
            if let Some(section) = sections.last_mut() {
                let range = rest.split_whitespace().next().unwrap_or_default();
                if let Some((old, new)) = range.split_once("..") {
                    section.old_revision = Some(old.to_string());
                    section.new_revision = Some(new.to_string());
                }
            }
        } else if line.starts_with("@@") {
            if sections.is_empty() {
                sections.push(Section::starting_at(number));
            }
            let Some(section) = sections.last_mut() else {
                continue;
            };
            if section.error.is_some() {
                continue;
            }
            match parse_hunk_header(line) {
                Some(header) => {
                    section.hunks.push(header);
                    let open = OpenHunk {
                        old_line: header.old_start,
                        new_line: header.new_start,
                        old_left: header.old_count,
                        new_left: header.new_count,
                    };
                    in_run = false;
                    if !open.is_done() {
                        hunk = Some(open);
                    }
                }
                None => section.fail(number, format!("unparsable hunk header `{line}`")),
            }
        }
    }

    if let Some(open) = hunk {
        if !open.is_done() {
            if let Some(section) = sections.last_mut() {
                let line = text.lines().count();
                section.fail(line, "diff ends inside a hunk");
            }
        }
    }
    sections
}

/// Paths from `diff --git a/x b/y`.
fn git_header_paths(rest: &str) -> Option<(String, String)> {
    let (old, new) = rest.split_once(" b/")?;
    let old = old.strip_prefix("a/").unwrap_or(old);
    Some((old.to_string(), new.to_string()))
}

/// Path of a `---`/`+++` header; `/dev/null` means no file.
fn header_path(rest: &str) -> Option<String> {
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    if path == "/dev/null" {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

/// `@@ -a[,b] +c[,d] @@ ...`; omitted counts are 1.
fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let body = line.strip_prefix("@@ ")?;
    let (ranges, _) = body.split_once(" @@")?;
    let (old, new) = ranges.split_once(' ')?;
    let (old_start, old_count) = parse_range(old.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(new.strip_prefix('+')?)?;
    Some(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Contiguous changed lines of one side that share an enclosing scope.
#[derive(Debug)]
struct Segment {
    scope: Option<NodeId>,
    label: Option<String>,
    method: Option<MethodSignature>,
    lines: Vec<usize>,
}

fn map_blocks(
    changes: &[LineChange],
    pre: Option<&SyntaxTree>,
    post: Option<&SyntaxTree>,
) -> AnalysisResult<Vec<BlockDiff>> {
    let mut runs: BTreeMap<usize, Vec<LineChange>> = BTreeMap::new();
    for change in changes {
        runs.entry(change.run).or_default().push(*change);
    }

    let mut blocks: Vec<BlockDiff> = Vec::new();
    for changes in runs.values() {
        let deletions = segments(changes, Side::Old, pre)?;
        let mut additions: Vec<Option<Segment>> = segments(changes, Side::New, post)?
            .into_iter()
            .map(Some)
            .collect();

        for deletion in deletions {
            let partner = additions.iter_mut().find(|slot| {
                slot.as_ref()
                    .is_some_and(|addition| addition.label == deletion.label)
            });
            let block = match partner.and_then(Option::take) {
                Some(addition) => BlockDiff {
                    kind: ChangeKind::Modification,
                    block: BlockRef {
                        pre: deletion.scope,
                        post: addition.scope,
                        label: addition.label,
                        method: addition.method.or(deletion.method),
                    },
                    deleted: deletion.lines,
                    added: addition.lines,
                },
                None => BlockDiff {
                    kind: ChangeKind::Deletion,
                    block: BlockRef {
                        pre: deletion.scope,
                        post: None,
                        label: deletion.label,
                        method: deletion.method,
                    },
                    deleted: deletion.lines,
                    added: Vec::new(),
                },
            };
            push_merged(&mut blocks, block);
        }
        for addition in additions.into_iter().flatten() {
            push_merged(
                &mut blocks,
                BlockDiff {
                    kind: ChangeKind::Addition,
                    block: BlockRef {
                        pre: None,
                        post: addition.scope,
                        label: addition.label,
                        method: addition.method,
                    },
                    deleted: Vec::new(),
                    added: addition.lines,
                },
            );
        }
    }
    Ok(blocks)
}

/// Merge with the previous block diff when both touch the same block the same way.
fn push_merged(blocks: &mut Vec<BlockDiff>, block: BlockDiff) {
    if let Some(last) = blocks.last_mut() {
        if last.kind == block.kind && last.block == block.block {
            last.deleted.extend(block.deleted);
            last.added.extend(block.added);
            return;
        }
    }
    blocks.push(block);
}

fn segments(
    changes: &[LineChange],
    side: Side,
    tree: Option<&SyntaxTree>,
) -> AnalysisResult<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    for change in changes.iter().filter(|change| change.side == side) {
        let scope = match tree {
            Some(tree) => {
                if change.line == 0 || change.line > tree.line_count {
                    return Err(AnalysisError::malformed_diff(
                        change.diff_line,
                        format!(
                            "line {} is outside {} ({} lines)",
                            change.line, tree.path, tree.line_count
                        ),
                    ));
                }
                tree.enclosing_block(change.line)
            }
            None => None,
        };
        if let Some(last) = segments.last_mut() {
            if last.scope == scope {
                last.lines.push(change.line);
                continue;
            }
        }
        let (label, method) = match (tree, scope) {
            (Some(tree), Some(scope)) => (
                tree.block_label(scope),
                tree.enclosing_method(scope)
                    .and_then(|method| tree.method_signature(method)),
            ),
            _ => (None, None),
        };
        segments.push(Segment {
            scope,
            label,
            method,
            lines: vec![change.line],
        });
    }
    Ok(segments)
}
