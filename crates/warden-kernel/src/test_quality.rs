//! Quality gate for oracle-written tests
//!
//! A red test proves nothing unless it exercises the code under test. A
//! proposed test is rejected when it never imports a module the plan
//! changes, when it asserts only on mocks, or when it patches one of those
//! modules away. Heavy mocking on its own is only a warning.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use warden_plan::PlanEnvelope;

/// Source extensions whose tests import what they exercise
const MODULE_EXTENSIONS: &[&str] = &["py", "js", "jsx", "mjs", "cjs", "ts", "tsx"];

/// Layout roots that are not part of an import path
const SOURCE_ROOTS: &[&str] = &["src/", "lib/"];

static REAL_ASSERTION: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*assert\b|\bself\.assert[A-Z]\w*\(|\bexpect\(|\bassert(?:_eq|_ne)?!\(|\bassert\.\w+\(").ok()
});

static MOCK_ASSERTION: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\.assert_(?:called|any_call|not_called|has_calls|awaited)\w*\(|\.toHaveBeenCalled\w*\(").ok()
});

static MOCK_CONSTRUCT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\b(?:Mock|MagicMock|AsyncMock)\(|@?\bpatch(?:\.object)?\(|\b(?:jest|vi)\.(?:mock|fn|spyOn)\(").ok()
});

static IMPORT_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*(?:from\s+\S+\s+import\b|import\b)|\brequire\(").ok());

/// Why a proposed test was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestSmell {
    /// No import of any module the plan changes
    MissingSutImport { modules: Vec<String> },
    /// Nothing is asserted, or only mock calls are
    NoRealAssertion { mock_assertions: usize },
    /// The module under test is replaced by a mock
    MocksSut { module: String },
}

impl fmt::Display for TestSmell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSutImport { modules } => {
                write!(f, "imports none of the modules under test ({})", modules.join(", "))
            }
            Self::NoRealAssertion { mock_assertions: 0 } => f.write_str("asserts nothing"),
            Self::NoRealAssertion { mock_assertions } => {
                write!(f, "asserts only on mocks ({mock_assertions} mock assertions)")
            }
            Self::MocksSut { module } => write!(f, "mocks the module under test `{module}`"),
        }
    }
}

/// Assessment of one test file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestQuality {
    /// Test file path
    pub path: String,
    /// Assertions on real values
    pub real_assertions: usize,
    /// Assertions on mock calls
    pub mock_assertions: usize,
    /// Mocks, patches and spies created
    pub mocks: usize,
    /// Reasons the file is rejected
    pub smells: Vec<TestSmell>,
    /// Concerns that do not reject the file
    pub warnings: Vec<String>,
}

impl TestQuality {
    /// True when nothing rejects the file
    #[must_use]
    pub fn passed(&self) -> bool {
        self.smells.is_empty()
    }
}

impl fmt::Display for TestQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let smells: Vec<String> = self.smells.iter().map(ToString::to_string).collect();
        if smells.is_empty() {
            write!(f, "{}: ok", self.path)
        } else {
            write!(f, "{}: {}", self.path, smells.join("; "))
        }
    }
}

/// Import names of the non-test source files the plan creates or modifies
#[must_use]
pub fn sut_modules(envelope: &PlanEnvelope) -> Vec<String> {
    let content = envelope.content();
    let scope = &content.scope;
    let mut modules: Vec<String> = scope
        .created
        .iter()
        .chain(scope.modified.iter())
        .filter(|p| !content.test_files.contains(*p))
        .filter_map(|p| module_name(p))
        .collect();
    modules.sort();
    modules.dedup();
    modules
}

/// Dotted import name for a source path; `None` for non-module files
fn module_name(path: &str) -> Option<String> {
    let (stem, ext) = path.rsplit_once('.')?;
    if !MODULE_EXTENSIONS.contains(&ext) {
        return None;
    }
    let stem = SOURCE_ROOTS
        .iter()
        .find_map(|root| stem.strip_prefix(root))
        .unwrap_or(stem);
    let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
    let stem = stem.strip_suffix("/index").unwrap_or(stem);
    if stem.is_empty() {
        return None;
    }
    Some(stem.replace('/', "."))
}

/// Whether `path` is a language whose tests import their subject
fn checks_imports(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| MODULE_EXTENSIONS.contains(&ext))
}

/// Assess a proposed test file against the modules it should exercise
#[must_use]
pub fn assess_test(path: &str, content: &str, sut: &[String]) -> TestQuality {
    let count = |pattern: &Lazy<Option<Regex>>| {
        pattern
            .as_ref()
            .map_or(0, |re| content.lines().filter(|l| re.is_match(l)).count())
    };
    let mock_assertions = count(&MOCK_ASSERTION);
    let real_assertions = count(&REAL_ASSERTION);
    let mocks = count(&MOCK_CONSTRUCT);

    let mut smells = Vec::new();
    let mut warnings = Vec::new();

    if !sut.is_empty() && checks_imports(path) && !sut.iter().any(|m| imports(content, m)) {
        smells.push(TestSmell::MissingSutImport { modules: sut.to_vec() });
    }
    if real_assertions == 0 {
        smells.push(TestSmell::NoRealAssertion { mock_assertions });
    }
    for module in sut {
        if mocks_module(content, module) {
            smells.push(TestSmell::MocksSut { module: module.clone() });
        }
    }
    if mock_assertions > 0 {
        warnings.push(format!("{mock_assertions} assertions on mock calls"));
    }
    if mocks > real_assertions {
        warnings.push(format!("{mocks} mocks against {real_assertions} real assertions"));
    }

    TestQuality {
        path: path.to_string(),
        real_assertions,
        mock_assertions,
        mocks,
        smells,
        warnings,
    }
}

fn imports(content: &str, module: &str) -> bool {
    let Some(import_line) = IMPORT_LINE.as_ref() else {
        return false;
    };
    let slashed = module.replace('.', "/");
    let split = module.rsplit_once('.');
    content.lines().filter(|l| import_line.is_match(l)).any(|line| {
        mentions(line, module)
            || mentions(line, &slashed)
            || split.is_some_and(|(parent, leaf)| mentions(line, parent) && mentions(line, leaf))
    })
}

/// `name` occurs in `line` with no identifier character on either side
fn mentions(line: &str, name: &str) -> bool {
    let ident = |c: char| c.is_alphanumeric() || c == '_';
    line.match_indices(name).any(|(at, _)| {
        let before = line[..at].chars().next_back();
        let after = line[at + name.len()..].chars().next();
        !before.is_some_and(ident) && !after.is_some_and(ident)
    })
}

fn mocks_module(content: &str, module: &str) -> bool {
    let slashed = module.replace('.', "/");
    let pattern = format!(
        r#"(?:patch|patch\.object|(?:jest|vi)\.mock)\(\s*['"](?:[\w.-]*/)*(?:{}|{})(?:['"./]|$)"#,
        regex::escape(module),
        regex::escape(&slashed)
    );
    Regex::new(&pattern).is_ok_and(|re| re.is_match(content))
}
