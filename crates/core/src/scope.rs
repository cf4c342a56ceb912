//! The scoping model the passes operate on.
//!
//! A *var context* is the lexical scope `var`-style declarations live in: any
//! function-like node, or the program root. Identifier classification here is
//! deliberately shallow — it distinguishes binding, write and read positions
//! from the parent chain and does no alias analysis.

use std::collections::HashSet;

use crate::ast::{Ast, NodeId, NodeKind};
use crate::visit::Ancestors;

/// ECMAScript keywords that generated identifiers must avoid.
pub const RESERVED_KEYWORDS: &[&str] = &[
    "break",
    "case",
    "catch",
    "class",
    "const",
    "continue",
    "debugger",
    "default",
    "delete",
    "do",
    "else",
    "enum",
    "export",
    "extends",
    "false",
    "finally",
    "for",
    "function",
    "if",
    "implements",
    "import",
    "in",
    "instanceof",
    "interface",
    "let",
    "new",
    "null",
    "package",
    "private",
    "protected",
    "public",
    "return",
    "static",
    "super",
    "switch",
    "this",
    "throw",
    "true",
    "try",
    "typeof",
    "var",
    "void",
    "while",
    "with",
    "yield",
    "await",
];

/// Well-known bindings the passes must neither shadow nor rewrite. Standard
/// built-ins live here too: they resolve globally in any realm, so they are
/// never treated as captured variables.
pub const RESERVED_IDENTIFIERS: &[&str] = &[
    "undefined",
    "NaN",
    "Infinity",
    "eval",
    "arguments",
    "globalThis",
    "require",
    "module",
    "exports",
    "Array",
    "Boolean",
    "Date",
    "Error",
    "Function",
    "JSON",
    "Math",
    "Number",
    "Object",
    "Promise",
    "RangeError",
    "ReferenceError",
    "RegExp",
    "String",
    "Symbol",
    "SyntaxError",
    "TypeError",
    "console",
];

/// True if the name collides with a keyword or a reserved identifier.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_KEYWORDS.contains(&name) || RESERVED_IDENTIFIERS.contains(&name)
}

/// `Program` and `BlockStatement` are the block-like kinds.
pub fn is_block(ast: &Ast, id: NodeId) -> bool {
    matches!(
        ast.kind(id),
        NodeKind::Program { .. } | NodeKind::BlockStatement { .. }
    )
}

/// The statement list of a block-like node.
pub fn block_body(ast: &Ast, id: NodeId) -> Option<&[NodeId]> {
    match ast.kind(id) {
        NodeKind::Program { body } | NodeKind::BlockStatement { body } => Some(body),
        _ => None,
    }
}

/// Mutable access to the statement list of a block-like node.
pub fn block_body_mut(ast: &mut Ast, id: NodeId) -> Option<&mut Vec<NodeId>> {
    match ast.kind_mut(id) {
        NodeKind::Program { body } | NodeKind::BlockStatement { body } => Some(body),
        _ => None,
    }
}

/// A var context is any function-like node or the program root.
pub fn is_var_context(ast: &Ast, id: NodeId) -> bool {
    ast.kind(id).is_function() || matches!(ast.kind(id), NodeKind::Program { .. })
}

/// The nearest enclosing var context of a node.
pub fn var_context_of(ast: &Ast, ancestors: &Ancestors<'_>) -> Option<NodeId> {
    ancestors.iter().find(|a| is_var_context(ast, *a))
}

/// How an identifier occurrence relates to the binding it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentUsage {
    /// A binding position: declarator id, parameter, function name, catch
    /// parameter, or an element of a binding pattern.
    Defined,
    /// A write: assignment target or update operand.
    Modified,
    /// A read.
    Referenced,
    /// Not a variable reference at all: member property, property key,
    /// label, and similar syntactic positions.
    NotAReference,
}

/// Classifies an identifier occurrence from its parent chain.
pub fn classify(ast: &Ast, id: NodeId, ancestors: &Ancestors<'_>) -> IdentUsage {
    let Some(parent) = ancestors.parent() else {
        return IdentUsage::Referenced;
    };
    match ast.kind(parent) {
        NodeKind::VariableDeclarator { id: decl_id, .. } if *decl_id == id => IdentUsage::Defined,
        NodeKind::FunctionDeclaration(f)
        | NodeKind::FunctionExpression(f)
        | NodeKind::ArrowFunctionExpression(f) => {
            if f.id == Some(id) || f.params.contains(&id) {
                IdentUsage::Defined
            } else {
                IdentUsage::Referenced
            }
        }
        NodeKind::AssignmentExpression { left, .. } if *left == id => IdentUsage::Modified,
        NodeKind::UpdateExpression { .. } => IdentUsage::Modified,
        NodeKind::MemberExpression {
            property,
            computed: false,
            ..
        } if *property == id => IdentUsage::NotAReference,
        NodeKind::Property {
            key,
            computed: false,
            ..
        } if *key == id => IdentUsage::NotAReference,
        NodeKind::MethodDefinition {
            key,
            computed: false,
            ..
        } if *key == id => IdentUsage::NotAReference,
        NodeKind::LabeledStatement { label, .. } if *label == id => IdentUsage::NotAReference,
        NodeKind::BreakStatement { label } | NodeKind::ContinueStatement { label }
            if *label == Some(id) =>
        {
            IdentUsage::NotAReference
        }
        NodeKind::CatchClause { param, .. } if *param == Some(id) => IdentUsage::Defined,
        NodeKind::ArrayPattern { .. } | NodeKind::RestElement { .. } => {
            classify_pattern_element(ast, id, ancestors)
        }
        _ => IdentUsage::Referenced,
    }
}

/// An identifier inside an `ArrayPattern`/`RestElement` chain binds or writes
/// depending on where the pattern itself sits.
fn classify_pattern_element(ast: &Ast, id: NodeId, ancestors: &Ancestors<'_>) -> IdentUsage {
    let mut child = id;
    for anc in ancestors.iter() {
        match ast.kind(anc) {
            NodeKind::ArrayPattern { .. } | NodeKind::RestElement { .. } => child = anc,
            NodeKind::VariableDeclarator { id: decl_id, .. } if *decl_id == child => {
                return IdentUsage::Defined
            }
            NodeKind::FunctionDeclaration(f)
            | NodeKind::FunctionExpression(f)
            | NodeKind::ArrowFunctionExpression(f)
                if f.params.contains(&child) =>
            {
                return IdentUsage::Defined
            }
            NodeKind::CatchClause { param, .. } if *param == Some(child) => {
                return IdentUsage::Defined
            }
            NodeKind::AssignmentExpression { left, .. } if *left == child => {
                return IdentUsage::Modified
            }
            _ => return IdentUsage::Referenced,
        }
    }
    IdentUsage::Referenced
}

/// How deep a read-only scan descends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    /// Visit everything.
    All,
    /// Do not enter nested function-like nodes.
    SkipFunctions,
    /// Enter arrows (they share `this`/`arguments`) but not plain functions.
    SkipNonArrowFunctions,
}

/// Read-only pre-order scan with ancestor tracking. The visitor returns
/// whether to descend into the node's children.
pub fn scan<F>(ast: &Ast, root: NodeId, descend: Descend, visitor: &mut F)
where
    F: FnMut(&Ast, NodeId, &Ancestors<'_>) -> bool,
{
    let mut chain = Vec::new();
    scan_inner(ast, root, root, descend, &mut chain, visitor);
}

fn scan_inner<F>(
    ast: &Ast,
    root: NodeId,
    id: NodeId,
    descend: Descend,
    chain: &mut Vec<NodeId>,
    visitor: &mut F,
) where
    F: FnMut(&Ast, NodeId, &Ancestors<'_>) -> bool,
{
    if !visitor(ast, id, &Ancestors::new(chain)) {
        return;
    }
    if id != root {
        let blocked = match descend {
            Descend::All => false,
            Descend::SkipFunctions => ast.kind(id).is_function(),
            Descend::SkipNonArrowFunctions => matches!(
                ast.kind(id),
                NodeKind::FunctionDeclaration(_) | NodeKind::FunctionExpression(_)
            ),
        };
        if blocked {
            return;
        }
    }
    chain.push(id);
    for child in ast.children_of(id) {
        scan_inner(ast, root, child, descend, chain, visitor);
    }
    chain.pop();
}

/// True if the subtree contains a node satisfying the predicate, honoring the
/// descent policy.
pub fn subtree_contains<P>(ast: &Ast, root: NodeId, descend: Descend, mut pred: P) -> bool
where
    P: FnMut(&Ast, NodeId) -> bool,
{
    let mut found = false;
    scan(ast, root, descend, &mut |ast, id, _| {
        if found {
            return false;
        }
        if pred(ast, id) {
            found = true;
            return false;
        }
        true
    });
    found
}

/// True if the node's own context mentions `this` or `super`. Arrows are
/// entered because they inherit the caller's binding.
pub fn is_bound(ast: &Ast, root: NodeId) -> bool {
    subtree_contains(ast, root, Descend::SkipNonArrowFunctions, |ast, id| {
        matches!(ast.kind(id), NodeKind::ThisExpression | NodeKind::Super)
    })
}

/// True if the node's own context reads `arguments`.
pub fn references_arguments(ast: &Ast, root: NodeId) -> bool {
    subtree_contains(ast, root, Descend::SkipNonArrowFunctions, |ast, id| {
        ast.ident_name(id) == Some("arguments")
    })
}

/// True if the subtree declares `let`/`const` outside nested functions.
/// Statements hoisted out of such a block would change meaning.
pub fn contains_lexical_declarations(ast: &Ast, root: NodeId) -> bool {
    subtree_contains(ast, root, Descend::SkipFunctions, |ast, id| {
        matches!(
            ast.kind(id),
            NodeKind::VariableDeclaration { kind, .. } if kind.is_lexical()
        )
    })
}

/// Collects the identifier names bound inside a binding pattern.
pub fn pattern_names(ast: &Ast, id: NodeId, out: &mut HashSet<String>) {
    match ast.kind(id) {
        NodeKind::Identifier { name } => {
            out.insert(name.clone());
        }
        NodeKind::ArrayPattern { elements } => {
            for el in elements.clone() {
                pattern_names(ast, el, out);
            }
        }
        NodeKind::RestElement { argument } => pattern_names(ast, *argument, out),
        _ => {}
    }
}

/// The names declared directly in a var context: its own name (for named
/// function expressions), parameters, `var`/`let`/`const` declarators,
/// function declarations and catch parameters. Nested var contexts are not
/// entered, but their declaration names are recorded where they bind (a
/// nested `function f` binds `f` in this context).
pub fn declared_names(ast: &Ast, ctx: NodeId) -> HashSet<String> {
    let mut names = HashSet::new();
    if let Some(f) = ast.kind(ctx).as_function() {
        if let Some(id) = f.id {
            if let Some(name) = ast.ident_name(id) {
                names.insert(name.to_string());
            }
        }
        for p in &f.params {
            pattern_names(ast, *p, &mut names);
        }
    }
    let body = match ast.kind(ctx) {
        NodeKind::Program { body } => body.clone(),
        _ => match ast.kind(ctx).as_function() {
            Some(f) => vec![f.body],
            None => return names,
        },
    };
    for root in body {
        scan(ast, root, Descend::All, &mut |ast, id, _| {
            match ast.kind(id) {
                NodeKind::FunctionDeclaration(f) => {
                    if let Some(fid) = f.id {
                        if let Some(name) = ast.ident_name(fid) {
                            names.insert(name.to_string());
                        }
                    }
                    false
                }
                NodeKind::FunctionExpression(_) | NodeKind::ArrowFunctionExpression(_) => false,
                NodeKind::VariableDeclarator { id: decl_id, .. } => {
                    pattern_names(ast, *decl_id, &mut names);
                    true
                }
                NodeKind::CatchClause { param, .. } => {
                    if let Some(p) = param {
                        pattern_names(ast, *p, &mut names);
                    }
                    true
                }
                _ => true,
            }
        });
    }
    names
}

/// True if `name` is declared in some enclosing var context of the node whose
/// ancestors are given, or is a configured global.
pub fn defined_above(
    ast: &Ast,
    name: &str,
    ancestors: &Ancestors<'_>,
    globals: &HashSet<String>,
) -> bool {
    if globals.contains(name) {
        return true;
    }
    ancestors
        .iter()
        .filter(|a| is_var_context(ast, *a))
        .any(|ctx| declared_names(ast, ctx).contains(name))
}

/// Identifier usage sets over a function (parameters and body, nested
/// functions included).
#[derive(Debug, Default)]
pub struct UsageSets {
    pub defined: HashSet<String>,
    pub referenced: HashSet<String>,
    pub modified: HashSet<String>,
}

impl UsageSets {
    /// `modified ∪ referenced − defined`: the names the function needs from
    /// its environment.
    pub fn free(&self) -> HashSet<String> {
        self.modified
            .union(&self.referenced)
            .filter(|n| !self.defined.contains(*n))
            .cloned()
            .collect()
    }
}

/// Collects usage sets over the subtree rooted at `root` (typically a
/// function node).
pub fn collect_usage(ast: &Ast, root: NodeId) -> UsageSets {
    let mut sets = UsageSets::default();
    scan(ast, root, Descend::All, &mut |ast, id, ancestors| {
        if let NodeKind::Identifier { name } = ast.kind(id) {
            match classify(ast, id, ancestors) {
                IdentUsage::Defined => {
                    sets.defined.insert(name.clone());
                }
                IdentUsage::Modified => {
                    sets.modified.insert(name.clone());
                }
                IdentUsage::Referenced => {
                    sets.referenced.insert(name.clone());
                }
                IdentUsage::NotAReference => {}
            }
        }
        true
    });
    sets
}
