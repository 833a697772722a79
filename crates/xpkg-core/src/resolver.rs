//! Dependency resolution: from one requested package to an install order.
//!
//! The resolver expands the dependency closure of a recipe or archive into
//! a directed graph over package names. Runtime dependencies contribute
//! edges everywhere; build dependencies contribute edges for recipe nodes,
//! after translation through the active toolset. Unresolved names are
//! looked up in the repos first (pre-built archives are cheaper than
//! builds), then the trees; a name found nowhere is fatal.
//!
//! Cycles are detected with a strongly-connected-components pass: any
//! non-trivial component, and any self-edge, aborts resolution. No attempt
//! is made to break cycles. The emitted plan is dependencies-first, so
//! walking it in order installs every dependency before its dependent.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use xpkg_schema::{DepSpec, Manifest, Recipe};

use crate::db::InstallDatabase;
use crate::error::{Result, XpkgError};
use crate::index::{CombinedSource, Located};
use crate::toolset::Toolset;

/// One step of an install plan.
#[derive(Debug)]
pub struct PlanItem {
    /// The package to install.
    pub name: String,
    /// Where it comes from.
    pub located: Located,
}

/// Resolves install plans against a pair of index source sets and the
/// install database.
#[derive(Debug)]
pub struct Resolver<'a> {
    repo: &'a CombinedSource,
    tree: &'a CombinedSource,
    db: &'a InstallDatabase,
    toolset: Option<&'a Toolset>,
}

impl<'a> Resolver<'a> {
    /// A resolver over the given sources.
    pub fn new(
        repo: &'a CombinedSource,
        tree: &'a CombinedSource,
        db: &'a InstallDatabase,
        toolset: Option<&'a Toolset>,
    ) -> Self {
        Self {
            repo,
            tree,
            db,
            toolset,
        }
    }

    /// Plan the dependencies that must be installed before building
    /// `recipe` and installing its outputs.
    ///
    /// Dependencies satisfied by sibling outputs of the same recipe are
    /// excluded: the build itself produces them, in topological order.
    ///
    /// # Errors
    ///
    /// Returns [`XpkgError::NotFound`], [`XpkgError::Conflict`], or
    /// [`XpkgError::DependencyCycle`] as described in the module docs.
    pub fn plan_for_recipe(&self, recipe: &Recipe) -> Result<Vec<PlanItem>> {
        let outputs = recipe.outputs()?;
        let siblings: BTreeSet<&str> = outputs.iter().map(|o| o.name.as_str()).collect();

        let mut seeds: Vec<DepSpec> = Vec::new();
        for output in &outputs {
            for dep in &output.dependencies {
                if !siblings.contains(dep.name()) {
                    seeds.push(dep.clone());
                }
            }
        }
        seeds.extend(self.resolve_build_deps(&recipe.build_dependencies)?);

        self.plan(&recipe.name, seeds)
    }

    /// Plan the dependencies that must be installed before extracting
    /// `manifest`'s archive.
    ///
    /// # Errors
    ///
    /// See [`Self::plan_for_recipe`].
    pub fn plan_for_manifest(&self, manifest: &Manifest) -> Result<Vec<PlanItem>> {
        self.plan(&manifest.name, manifest.dependencies.clone())
    }

    /// Translate build dependencies through the toolset. Without a toolset,
    /// `tl:` tokens cannot be resolved and only concrete names survive.
    fn resolve_build_deps(&self, build_deps: &[String]) -> Result<Vec<DepSpec>> {
        let mut out = Vec::new();

        for dep in build_deps {
            let resolved = match self.toolset {
                Some(ts) => ts.resolve(dep)?,
                None if dep.starts_with("tl:") => {
                    return Err(XpkgError::BadRecipe(format!(
                        "build dependency {dep} needs a toolset to resolve"
                    )));
                }
                None => Some(dep.clone()),
            };

            if let Some(name) = resolved {
                out.push(name.parse().map_err(|e| {
                    XpkgError::BadRecipe(format!("bad build dependency: {e}"))
                })?);
            }
        }

        Ok(out)
    }

    fn plan(&self, root: &str, seeds: Vec<DepSpec>) -> Result<Vec<PlanItem>> {
        let mut nodes: BTreeMap<String, Located> = BTreeMap::new();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut worklist: Vec<(String, Vec<DepSpec>)> = vec![(root.to_string(), seeds)];

        edges.entry(root.to_string()).or_default();

        while let Some((from, deps)) = worklist.pop() {
            for dep in deps {
                if dep.name() == from {
                    return Err(XpkgError::DependencyCycle(format!(
                        "{from} depends on itself"
                    )));
                }

                // An installed package satisfies the edge outright, or
                // conflicts with the pin; either way it is not re-planned.
                if let Some(record) = self.db.get(dep.name()) {
                    if !dep.matches(&record.version) {
                        return Err(XpkgError::Conflict(format!(
                            "{from} requires package {} at version {}, but {} is installed",
                            dep.name(),
                            dep.version().unwrap_or("latest"),
                            record.version
                        )));
                    }
                    continue;
                }

                edges
                    .entry(from.clone())
                    .or_default()
                    .insert(dep.name().to_string());

                if let Some(existing) = nodes.get(dep.name()) {
                    // Two dependents must agree on the version.
                    if !dep.matches(existing.version()) {
                        return Err(XpkgError::Conflict(format!(
                            "{from} requires {} but version {} was already selected",
                            dep,
                            existing.version()
                        )));
                    }
                    continue;
                }

                let located = self.locate(&dep)?;
                debug!(package = dep.name(), version = located.version(), "resolved");

                let next_deps = self.deps_of(dep.name(), &located)?;
                nodes.insert(dep.name().to_string(), located);
                edges.entry(dep.name().to_string()).or_default();
                worklist.push((dep.name().to_string(), next_deps));
            }
        }

        let order = scc_order(&edges)?;

        Ok(order
            .into_iter()
            .filter_map(|name| {
                nodes
                    .remove(&name)
                    .map(|located| PlanItem { name, located })
            })
            .collect())
    }

    /// Repo first, then tree; absence is fatal here.
    fn locate(&self, dep: &DepSpec) -> Result<Located> {
        self.repo
            .lookup(dep.name(), dep.version())
            .or_else(|| self.tree.lookup(dep.name(), dep.version()))
            .ok_or_else(|| {
                XpkgError::NotFound(format!("cannot find package for: {dep}"))
            })
    }

    /// The onward dependencies a resolved node contributes to the graph.
    fn deps_of(&self, name: &str, located: &Located) -> Result<Vec<DepSpec>> {
        match located {
            Located::Repo { manifest, .. } => Ok(manifest.dependencies.clone()),
            Located::Tree { recipe, .. } => {
                let outputs = recipe.outputs()?;
                let mut deps = outputs
                    .iter()
                    .find(|o| o.name == name)
                    .map(|o| o.dependencies.clone())
                    .unwrap_or_else(|| recipe.dependencies.clone());

                deps.extend(self.resolve_build_deps(&recipe.build_dependencies)?);
                Ok(deps)
            }
        }
    }
}

/// Tarjan's strongly-connected-components pass over `edges`.
///
/// Rejects self-loops and non-trivial components. Because Tarjan emits a
/// component only once all components reachable from it are emitted, the
/// emission order is already dependencies-first.
fn scc_order(edges: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>> {
    struct Tarjan<'g> {
        edges: &'g BTreeMap<String, BTreeSet<String>>,
        index: BTreeMap<&'g str, usize>,
        lowlink: BTreeMap<&'g str, usize>,
        on_stack: BTreeSet<&'g str>,
        stack: Vec<&'g str>,
        counter: usize,
        order: Vec<String>,
    }

    impl<'g> Tarjan<'g> {
        fn visit(&mut self, node: &'g str) -> Result<()> {
            self.index.insert(node, self.counter);
            self.lowlink.insert(node, self.counter);
            self.counter += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            for next in self.edges.get(node).into_iter().flatten() {
                if next == node {
                    return Err(XpkgError::DependencyCycle(format!(
                        "{node} depends on itself"
                    )));
                }

                if !self.index.contains_key(next.as_str()) {
                    self.visit(next)?;
                    let low = self.lowlink[next.as_str()].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next.as_str()) {
                    let low = self.index[next.as_str()].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                }
            }

            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(top) = self.stack.pop() {
                    self.on_stack.remove(top);
                    component.push(top.to_string());
                    if top == node {
                        break;
                    }
                }

                if component.len() > 1 {
                    component.sort();
                    return Err(XpkgError::DependencyCycle(component.join(", ")));
                }

                self.order.extend(component);
            }

            Ok(())
        }
    }

    let mut tarjan = Tarjan {
        edges,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        on_stack: BTreeSet::new(),
        stack: Vec::new(),
        counter: 0,
        order: Vec::new(),
    };

    for node in edges.keys() {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node)?;
        }
    }

    Ok(tarjan.order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use crate::index::{PackageSource, PackageTree};

    struct Fixture {
        _tree_dir: tempfile::TempDir,
        _cache_dir: tempfile::TempDir,
        _prefix: tempfile::TempDir,
        tree: CombinedSource,
        repo: CombinedSource,
        db: InstallDatabase,
    }

    fn write_xpd(dir: &Path, name: &str, version: &str, deps: &[&str], build_deps: &[&str]) {
        let mut yaml = format!("name: {name}\nversion: '{version}'\n");
        if !deps.is_empty() {
            yaml.push_str(&format!("dependencies: [{}]\n", deps.join(", ")));
        }
        if !build_deps.is_empty() {
            yaml.push_str(&format!("build-dependencies: [{}]\n", build_deps.join(", ")));
        }
        fs::write(dir.join(format!("{name}.xpd")), yaml).unwrap();
    }

    fn fixture(write: impl FnOnce(&Path)) -> Fixture {
        let tree_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();

        write(tree_dir.path());

        let tree = CombinedSource::new(vec![PackageSource::Tree(
            PackageTree::open(tree_dir.path(), cache_dir.path()).unwrap(),
        )]);
        let repo = CombinedSource::new(vec![]);
        let db = InstallDatabase::open(prefix.path()).unwrap();

        Fixture {
            _tree_dir: tree_dir,
            _cache_dir: cache_dir,
            _prefix: prefix,
            tree,
            repo,
            db,
        }
    }

    fn recipe(name: &str, deps: &[&str]) -> Recipe {
        let mut yaml = format!("name: {name}\nversion: '1.0'\n");
        if !deps.is_empty() {
            yaml.push_str(&format!("dependencies: [{}]\n", deps.join(", ")));
        }
        Recipe::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let fx = fixture(|tree| {
            write_xpd(tree, "b", "1.0", &["d"], &[]);
            write_xpd(tree, "c", "1.0", &["d"], &[]);
            write_xpd(tree, "d", "1.0", &[], &[]);
        });

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);
        let plan = resolver.plan_for_recipe(&recipe("a", &["b", "c"])).unwrap();

        let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();

        assert_eq!(names.len(), 3);
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
    }

    #[test]
    fn cycles_are_fatal() {
        let fx = fixture(|tree| {
            write_xpd(tree, "b", "1.0", &["c"], &[]);
            write_xpd(tree, "c", "1.0", &["b"], &[]);
        });

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);
        let err = resolver.plan_for_recipe(&recipe("a", &["b"])).unwrap_err();
        assert!(matches!(err, XpkgError::DependencyCycle(_)));
    }

    #[test]
    fn self_dependency_is_fatal() {
        let fx = fixture(|_| {});
        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);

        let err = resolver.plan_for_recipe(&recipe("a", &["a"])).unwrap_err();
        assert!(matches!(err, XpkgError::DependencyCycle(_)));
    }

    #[test]
    fn missing_package_is_fatal() {
        let fx = fixture(|_| {});
        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);

        let err = resolver.plan_for_recipe(&recipe("a", &["ghost"])).unwrap_err();
        assert!(matches!(err, XpkgError::NotFound(_)));
    }

    #[test]
    fn installed_dependencies_are_skipped() {
        let mut fx = fixture(|tree| {
            write_xpd(tree, "b", "1.0", &[], &[]);
        });

        fx.db
            .mark_installed(&Manifest {
                name: "b".into(),
                version: "1.0".into(),
                description: String::new(),
                dependencies: Vec::new(),
                dirs: Vec::new(),
                files: Vec::new(),
                install_path_offsets: xpkg_schema::PathOffsets::new("/b"),
            })
            .unwrap();

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);
        let plan = resolver.plan_for_recipe(&recipe("a", &["b"])).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn pin_against_installed_version_conflicts() {
        let mut fx = fixture(|tree| {
            write_xpd(tree, "libgreet", "2.0.0", &[], &[]);
        });

        fx.db
            .mark_installed(&Manifest {
                name: "libgreet".into(),
                version: "1.0.0".into(),
                description: String::new(),
                dependencies: Vec::new(),
                dirs: Vec::new(),
                files: Vec::new(),
                install_path_offsets: xpkg_schema::PathOffsets::new("/x"),
            })
            .unwrap();

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);
        let err = resolver
            .plan_for_recipe(&recipe("greeter", &["libgreet==2.0.0"]))
            .unwrap_err();

        match err {
            XpkgError::Conflict(msg) => assert!(msg.contains("libgreet")),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn pinned_version_is_selected_over_latest() {
        let fx = fixture(|tree| {
            write_xpd(tree, "zlib", "1.2.8", &[], &[]);
            let dir = tree.join("old");
            fs::create_dir_all(&dir).unwrap();
            write_xpd(&dir, "zlib", "1.2.3", &[], &[]);
        });

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);

        let plan = resolver
            .plan_for_recipe(&recipe("app", &["zlib==1.2.3"]))
            .unwrap();
        assert_eq!(plan[0].located.version(), "1.2.3");

        let plan = resolver.plan_for_recipe(&recipe("app", &["zlib"])).unwrap();
        assert_eq!(plan[0].located.version(), "1.2.8");
    }

    #[test]
    fn build_deps_resolve_through_the_toolset() {
        let fx = fixture(|tree| {
            write_xpd(tree, "tcc", "0.9", &[], &[]);
        });

        let mut toolset = Toolset::gnu();
        toolset
            .build_deps
            .insert("c-compiler".to_string(), "tcc".to_string());

        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, Some(&toolset));

        let root = Recipe::from_yaml(
            "name: app\nversion: '1.0'\nbuild-dependencies: ['tl:c-compiler']\n",
        )
        .unwrap();

        let plan = resolver.plan_for_recipe(&root).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "tcc");
    }

    #[test]
    fn no_build_deps_toolset_uses_the_host() {
        let fx = fixture(|_| {});
        let toolset = Toolset::local();
        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, Some(&toolset));

        let root = Recipe::from_yaml(
            "name: app\nversion: '1.0'\nbuild-dependencies: ['tl:c-compiler', 'tl:libc']\n",
        )
        .unwrap();

        let plan = resolver.plan_for_recipe(&root).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn sibling_outputs_do_not_resolve_externally() {
        let fx = fixture(|_| {});
        let resolver = Resolver::new(&fx.repo, &fx.tree, &fx.db, None);

        let root = Recipe::from_yaml(
            "\
name: multi
version: '1.0'
packages:
  libmulti:
    files: ['lib/.*']
  multi-tools:
    dependencies: [libmulti]
    files: ['bin/.*']
  multi-extras:
",
        )
        .unwrap();

        // libmulti is produced by the build itself; nothing external needed.
        let plan = resolver.plan_for_recipe(&root).unwrap();
        assert!(plan.is_empty());
    }
}
