//! What to build for one package, and the image definitions it renders to.

use std::path::PathBuf;

use cairn_schema::{BuildRecipe, Package, PackagesAssertions};
use regex::Regex;

/// Directory sources are copied to inside the builder image.
pub const BUILD_ROOT: &str = "/cairnbuild";

/// Everything needed to build one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationSpec {
    /// The package to build.
    pub package: Package,
    /// How to build it.
    pub recipe: BuildRecipe,
    /// Where images, archives and metadata are written.
    pub output_path: PathBuf,
    /// Ordered dependency tree, filled in by the compiler.
    pub source_assertion: PackagesAssertions,
}

impl CompilationSpec {
    /// A spec writing into the current directory, without a dependency tree yet.
    pub fn new(package: Package, recipe: BuildRecipe) -> Self {
        Self {
            package,
            recipe,
            output_path: PathBuf::from("."),
            source_assertion: PackagesAssertions::new(),
        }
    }

    /// Write images, archives and metadata under `output_path`.
    pub fn with_output_path(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = output_path.into();
        self
    }

    /// The same spec seeded from `image`.
    pub fn with_image(mut self, image: &str) -> Self {
        self.recipe.image = Some(image.to_string());
        self
    }

    /// Fingerprint of the package.
    pub fn fingerprint(&self) -> String {
        self.package.fingerprint()
    }

    /// Seed image, if the recipe names one.
    pub fn image(&self) -> Option<&str> {
        self.recipe.image.as_deref()
    }

    /// Whether the seed image itself is the package.
    pub fn unpack(&self) -> bool {
        self.recipe.unpack
    }

    /// Commands baked into the builder image.
    pub fn prelude(&self) -> &[String] {
        &self.recipe.prelude
    }

    /// Commands run in the step image.
    pub fn steps(&self) -> &[String] {
        &self.recipe.steps
    }

    /// Regexes selecting which changed paths are packaged.
    pub fn includes(&self) -> &[String] {
        &self.recipe.includes
    }

    /// `file` inside the output directory.
    pub fn rel(&self, file: &str) -> PathBuf {
        self.output_path.join(file)
    }

    /// Compiled `includes`.
    pub fn include_patterns(&self) -> Result<Vec<Regex>, regex::Error> {
        self.recipe.includes.iter().map(|p| Regex::new(p)).collect()
    }

    /// First stage: seed image, package sources and prelude.
    pub fn builder_definition(&self) -> String {
        let mut lines = vec![
            format!("FROM {}", self.image().unwrap_or("scratch")),
            format!("COPY . {BUILD_ROOT}"),
            format!("WORKDIR {BUILD_ROOT}"),
            format!("ENV PACKAGE_NAME={}", self.package.name),
            format!("ENV PACKAGE_VERSION={}", self.package.version),
            format!("ENV PACKAGE_CATEGORY={}", self.package.category),
        ];
        lines.extend(self.recipe.env.iter().map(|env| format!("ENV {env}")));
        lines.extend(self.prelude().iter().map(|command| format!("RUN {command}")));
        definition(lines)
    }

    /// Second stage: the build steps on top of `builder_image`.
    pub fn step_definition(&self, builder_image: &str) -> String {
        let mut lines = vec![format!("FROM {builder_image}")];
        lines.extend(self.steps().iter().map(|command| format!("RUN {command}")));
        definition(lines)
    }
}

/// One instruction per line, newline terminated.
fn definition(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// An ordered set of specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationSpecs(Vec<CompilationSpec>);

impl CompilationSpecs {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `spec`.
    pub fn add(&mut self, spec: CompilationSpec) {
        self.0.push(spec);
    }

    /// Number of specs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no specs.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first spec added.
    pub fn first(&self) -> Option<&CompilationSpec> {
        self.0.first()
    }

    /// Specs in order.
    pub fn iter(&self) -> std::slice::Iter<'_, CompilationSpec> {
        self.0.iter()
    }

    /// First occurrence of every fingerprint.
    pub fn unique(&self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.0
            .iter()
            .filter(|s| seen.insert(s.fingerprint()))
            .cloned()
            .collect()
    }

    /// Specs whose fingerprint does not appear in `other`.
    pub fn remove(&self, other: &CompilationSpecs) -> Self {
        self.0
            .iter()
            .filter(|s| !other.iter().any(|o| o.fingerprint() == s.fingerprint()))
            .cloned()
            .collect()
    }
}

impl FromIterator<CompilationSpec> for CompilationSpecs {
    fn from_iter<I: IntoIterator<Item = CompilationSpec>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for CompilationSpecs {
    type Item = CompilationSpec;
    type IntoIter = std::vec::IntoIter<CompilationSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
