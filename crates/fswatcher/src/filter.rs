//! Admission filter for global watchers.
//!
//! Include and exclude roots live in two tries keyed by path component. A path is admitted
//! when its deepest include ancestor is strictly deeper than its deepest exclude ancestor and
//! its extension is not in the excluded suffix set.

use std::{
	collections::{HashMap, HashSet},
	ffi::OsString,
	path::{Component, Path},
};

#[derive(Debug, Default)]
struct Node {
	children: HashMap<OsString, Node>,
	is_root: bool,
}

#[derive(Debug, Default)]
struct PathsTree {
	root: Node,
}

impl PathsTree {
	fn insert(&mut self, path: &Path) {
		let node = components(path).fold(&mut self.root, |node, component| {
			node.children.entry(component.to_os_string()).or_default()
		});

		node.is_root = true;
	}

	/// Depth of the deepest inserted root that is `path` itself or one of its ancestors.
	fn longest_match(&self, path: &Path) -> Option<usize> {
		let mut node = &self.root;
		let mut deepest = node.is_root.then_some(0);

		for (depth, component) in components(path).enumerate() {
			let Some(child) = node.children.get(component) else {
				break;
			};

			node = child;
			if node.is_root {
				deepest = Some(depth + 1);
			}
		}

		deepest
	}

	fn is_empty(&self) -> bool {
		!self.root.is_root && self.root.children.is_empty()
	}
}

fn components(path: &Path) -> impl Iterator<Item = &std::ffi::OsStr> {
	path.components().filter_map(|component| match component {
		Component::Normal(part) => Some(part),
		_ => None,
	})
}

fn normalize_suffix(suffix: &str) -> Option<String> {
	let suffix = suffix.trim().trim_start_matches('.');
	(!suffix.is_empty()).then(|| suffix.to_lowercase())
}

#[derive(Debug, Default)]
pub struct PathFilterTree {
	include: PathsTree,
	exclude: PathsTree,
	excluded_suffixes: HashSet<String>,
}

impl PathFilterTree {
	pub fn new<I, E, P, Q, S>(include: I, exclude: E, excluded_suffixes: S) -> Self
	where
		I: IntoIterator<Item = P>,
		E: IntoIterator<Item = Q>,
		P: AsRef<Path>,
		Q: AsRef<Path>,
		S: IntoIterator,
		S::Item: AsRef<str>,
	{
		let mut tree = Self::default();

		for path in include {
			tree.include.insert(path.as_ref());
		}

		for path in exclude {
			tree.exclude.insert(path.as_ref());
		}

		tree.excluded_suffixes = excluded_suffixes
			.into_iter()
			.filter_map(|suffix| normalize_suffix(suffix.as_ref()))
			.collect();

		tree
	}

	/// Global-event admission test.
	///
	/// When both an include and an exclude root are ancestors of `path`, the deeper one wins;
	/// an exclude root at the same depth as the include root rejects.
	#[must_use]
	pub fn admits(&self, path: impl AsRef<Path>) -> bool {
		let path = path.as_ref();

		let Some(included_at) = self.include.longest_match(path) else {
			return false;
		};

		if self
			.exclude
			.longest_match(path)
			.is_some_and(|excluded_at| excluded_at >= included_at)
		{
			return false;
		}

		path.extension()
			.and_then(|ext| ext.to_str())
			.and_then(normalize_suffix)
			.map_or(true, |ext| !self.excluded_suffixes.contains(&ext))
	}

	#[must_use]
	pub fn has_include_roots(&self) -> bool {
		!self.include.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn no_suffixes() -> Vec<String> {
		Vec::new()
	}

	#[test]
	fn exclude_subtree_inside_include_root() {
		let tree = PathFilterTree::new(["/home"], ["/home/.cache"], no_suffixes());

		assert!(tree.admits("/home/docs"));
		assert!(tree.admits("/home"));
		assert!(!tree.admits("/home/.cache/x"));
		assert!(!tree.admits("/home/.cache"));
		assert!(!tree.admits("/etc/passwd"));
	}

	#[test]
	fn deeper_include_wins_over_exclude() {
		let tree = PathFilterTree::new(
			["/home", "/home/.cache/keep"],
			["/home/.cache"],
			no_suffixes(),
		);

		assert!(tree.admits("/home/.cache/keep/file"));
		assert!(!tree.admits("/home/.cache/other"));
	}

	#[test]
	fn same_depth_exclude_rejects() {
		let tree = PathFilterTree::new(["/data"], ["/data"], no_suffixes());
		assert!(!tree.admits("/data/a"));
	}

	#[test]
	fn prefix_match_is_by_component() {
		let tree = PathFilterTree::new(["/home"], Vec::<&str>::new(), no_suffixes());
		assert!(!tree.admits("/homework/a"));
	}

	#[test]
	fn root_include_admits_everything() {
		let tree = PathFilterTree::new(["/"], ["/proc"], no_suffixes());
		assert!(tree.has_include_roots());
		assert!(tree.admits("/"));
		assert!(tree.admits("/usr/lib"));
		assert!(!tree.admits("/proc/1/status"));
	}

	#[test]
	fn excluded_suffixes() {
		let tree = PathFilterTree::new(["/"], Vec::<&str>::new(), [".o", "TMP", " swp "]);

		assert!(!tree.admits("/src/main.o"));
		assert!(!tree.admits("/src/scratch.tmp"));
		assert!(!tree.admits("/src/.main.rs.swp"));
		assert!(tree.admits("/src/main.rs"));
		assert!(tree.admits("/src/o"));
	}

	#[test]
	fn empty_tree_admits_nothing() {
		let tree = PathFilterTree::default();
		assert!(!tree.has_include_roots());
		assert!(!tree.admits("/anything"));
	}
}
