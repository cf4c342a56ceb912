//! Chunk construction for control flow flattening.
//!
//! Statements are packed into chunks; every chunk terminates in exactly one
//! synthetic goto naming its successor. Structured statements — `if`, labeled
//! loops, labeled switches — are exploded into chunk graphs of their own;
//! everything else rides along unchanged, with a random draw deciding where
//! plain runs get cut.

use rand::Rng;
use umbra_core::ast::{Ast, BinaryOp, NodeId, NodeKind};
use umbra_core::scope::block_body;
use umbra_utils::errors::TransformError;

use crate::PassContext;

/// A contiguous run of statements ending in exactly one goto.
pub(crate) struct Chunk {
    pub label: String,
    pub body: Vec<NodeId>,
}

/// Linear chunk builder; structures recurse through `process_statements`.
pub(crate) struct ChunkBuilder {
    chunks: Vec<Chunk>,
    current_label: String,
    current_body: Vec<NodeId>,
    fraction: f64,
}

impl ChunkBuilder {
    pub fn new(entry_label: String, fraction: f64) -> Self {
        Self {
            chunks: Vec::new(),
            current_label: entry_label,
            current_body: Vec::new(),
            fraction,
        }
    }

    /// Terminates the current chunk with `goto target` and opens a new chunk
    /// labeled `next`.
    fn end_chunk(&mut self, ast: &mut Ast, target: &str, next: String) {
        let goto = ast.goto(target);
        self.current_body.push(goto);
        let body = std::mem::take(&mut self.current_body);
        self.chunks.push(Chunk {
            label: std::mem::replace(&mut self.current_label, next),
            body,
        });
    }

    /// Closes the final chunk with a goto to the end state and returns all
    /// chunks. Every chunk ends in a goto by construction; nothing is popped.
    pub fn finish(mut self, ast: &mut Ast, end_label: &str) -> Vec<Chunk> {
        let goto = ast.goto(end_label);
        self.current_body.push(goto);
        self.chunks.push(Chunk {
            label: self.current_label,
            body: self.current_body,
        });
        self.chunks
    }

    pub fn process_statements(
        &mut self,
        ast: &mut Ast,
        cx: &mut PassContext<'_>,
        stmts: &[NodeId],
    ) -> Result<(), TransformError> {
        for stmt in stmts {
            self.process_statement(ast, cx, *stmt)?;
        }
        Ok(())
    }

    fn process_statement(
        &mut self,
        ast: &mut Ast,
        cx: &mut PassContext<'_>,
        stmt: NodeId,
    ) -> Result<(), TransformError> {
        match ast.kind(stmt).clone() {
            NodeKind::IfStatement {
                test,
                consequent,
                alternate,
            } => self.explode_if(ast, cx, test, consequent, alternate),
            NodeKind::LabeledStatement { label, body } => {
                let label_name = ast
                    .ident_name(label)
                    .ok_or(TransformError::NullIdentifier)?
                    .to_string();
                match ast.kind(body).clone() {
                    NodeKind::ForStatement {
                        init,
                        test,
                        update,
                        body: loop_body,
                    } => {
                        if !self.explode_loop(
                            ast, cx, &label_name, init, test, update, loop_body, false,
                        )? {
                            self.plain(ast, cx, stmt);
                        }
                        Ok(())
                    }
                    NodeKind::WhileStatement { test, body: loop_body } => {
                        if !self.explode_loop(
                            ast,
                            cx,
                            &label_name,
                            None,
                            Some(test),
                            None,
                            loop_body,
                            false,
                        )? {
                            self.plain(ast, cx, stmt);
                        }
                        Ok(())
                    }
                    NodeKind::DoWhileStatement { body: loop_body, test } => {
                        if !self.explode_loop(
                            ast,
                            cx,
                            &label_name,
                            None,
                            Some(test),
                            None,
                            loop_body,
                            true,
                        )? {
                            self.plain(ast, cx, stmt);
                        }
                        Ok(())
                    }
                    NodeKind::SwitchStatement {
                        discriminant,
                        cases,
                    } => {
                        if !self.explode_switch(ast, cx, &label_name, discriminant, &cases)? {
                            self.plain(ast, cx, stmt);
                        }
                        Ok(())
                    }
                    _ => {
                        self.plain(ast, cx, stmt);
                        Ok(())
                    }
                }
            }
            _ => {
                self.plain(ast, cx, stmt);
                Ok(())
            }
        }
    }

    /// Plain statement: append, then maybe cut the chunk.
    fn plain(&mut self, ast: &mut Ast, cx: &mut PassContext<'_>, stmt: NodeId) {
        self.current_body.push(stmt);
        if cx.rng.random::<f64>() < self.fraction {
            let next = cx.names.placeholder(cx.rng);
            let target = next.clone();
            self.end_chunk(ast, &target, next);
        }
    }

    /// `if (t) { A } else? { B }` becomes a conditional goto plus one chunk
    /// per branch, all converging on a fresh continuation chunk.
    fn explode_if(
        &mut self,
        ast: &mut Ast,
        cx: &mut PassContext<'_>,
        test: NodeId,
        consequent: NodeId,
        alternate: Option<NodeId>,
    ) -> Result<(), TransformError> {
        let yes = cx.names.placeholder(cx.rng);
        let after = cx.names.placeholder(cx.rng);
        let no = match alternate {
            Some(_) => cx.names.placeholder(cx.rng),
            None => after.clone(),
        };

        let goto_yes = ast.goto(yes.clone());
        let cond = ast.if_stmt(test, goto_yes, None);
        self.current_body.push(cond);
        self.end_chunk(ast, &no, yes);

        let cons_stmts = statements_of(ast, consequent);
        self.process_statements(ast, cx, &cons_stmts)?;
        match alternate {
            Some(alt) => {
                self.end_chunk(ast, &after, no);
                let alt_stmts = statements_of(ast, alt);
                self.process_statements(ast, cx, &alt_stmts)?;
                self.end_chunk(ast, &after, after.clone());
            }
            None => {
                self.end_chunk(ast, &after, after.clone());
            }
        }
        Ok(())
    }

    /// Labeled loop explosion: allocate `test`/`update`/`body`/`after`
    /// chunks, retarget the loop's jumps onto them, and lay the pieces out
    /// linearly. Returns false (leaving the tree untouched) when a jump
    /// targets some other label.
    #[allow(clippy::too_many_arguments)]
    fn explode_loop(
        &mut self,
        ast: &mut Ast,
        cx: &mut PassContext<'_>,
        label: &str,
        init: Option<NodeId>,
        test: Option<NodeId>,
        update: Option<NodeId>,
        loop_body: NodeId,
        post_test: bool,
    ) -> Result<bool, TransformError> {
        if !matches!(ast.kind(loop_body), NodeKind::BlockStatement { .. }) {
            return Ok(false);
        }

        let test_l = cx.names.placeholder(cx.rng);
        let update_l = cx.names.placeholder(cx.rng);
        let body_l = cx.names.placeholder(cx.rng);
        let after_l = cx.names.placeholder(cx.rng);

        let Some(rewrites) = plan_jump_rewrites(ast, loop_body, label, &after_l, &update_l) else {
            return Ok(false);
        };
        for (jump, target) in rewrites {
            ast.replace(jump, NodeKind::Goto { label: target });
        }

        if let Some(init) = init {
            let init_stmt = if matches!(ast.kind(init), NodeKind::VariableDeclaration { .. }) {
                init
            } else {
                ast.expr_stmt(init)
            };
            self.current_body.push(init_stmt);
        }

        // A post-test loop enters at the body; pre-test loops enter at the
        // test chunk.
        if post_test {
            self.end_chunk(ast, &body_l, test_l.clone());
        } else {
            self.end_chunk(ast, &test_l, test_l.clone());
        }

        // test chunk: if (t) goto body; goto after
        match test {
            Some(test) => {
                let goto_body = ast.goto(body_l.clone());
                let cond = ast.if_stmt(test, goto_body, None);
                self.current_body.push(cond);
                self.end_chunk(ast, &after_l, body_l);
            }
            None => {
                self.end_chunk(ast, &body_l.clone(), body_l);
            }
        }

        // body chunks, ending at the update chunk
        let body_stmts = statements_of(ast, loop_body);
        self.process_statements(ast, cx, &body_stmts)?;
        self.end_chunk(ast, &update_l, update_l.clone());

        // update chunk: run the update expression, back to the test
        if let Some(update) = update {
            let update_stmt = ast.expr_stmt(update);
            self.current_body.push(update_stmt);
        }
        self.end_chunk(ast, &test_l, after_l);
        Ok(true)
    }

    /// Labeled switch explosion: store the discriminant in a temporary, turn
    /// the cases into an `if (tmp === test) goto caseN` chain, and flatten
    /// each case body as its own chunk run.
    fn explode_switch(
        &mut self,
        ast: &mut Ast,
        cx: &mut PassContext<'_>,
        label: &str,
        discriminant: NodeId,
        cases: &[NodeId],
    ) -> Result<bool, TransformError> {
        if cases.is_empty() {
            return Ok(false);
        }
        // Every case must carry a test, a non-empty body, and end in exactly
        // one `break <label>`; no other jump may touch the switch label.
        let mut bodies: Vec<(NodeId, Vec<NodeId>)> = Vec::with_capacity(cases.len());
        for case in cases {
            let NodeKind::SwitchCase { test, consequent } = ast.kind(*case) else {
                return Ok(false);
            };
            let Some(test) = test else { return Ok(false) };
            let Some((last, rest)) = consequent.split_last() else {
                return Ok(false);
            };
            let is_break_label = matches!(
                ast.kind(*last),
                NodeKind::BreakStatement { label: Some(l) } if ast.ident_name(*l) == Some(label)
            );
            if !is_break_label {
                return Ok(false);
            }
            if rest
                .iter()
                .any(|stmt| contains_unstructured_jump(ast, *stmt, label))
            {
                return Ok(false);
            }
            bodies.push((*test, rest.to_vec()));
        }

        let tmp = cx.names.placeholder(cx.rng);
        let decl = ast.var_decl(tmp.clone(), Some(discriminant));
        self.current_body.push(decl);

        let after_l = cx.names.placeholder(cx.rng);
        let case_labels: Vec<String> = bodies
            .iter()
            .map(|_| cx.names.placeholder(cx.rng))
            .collect();

        for ((test, _), case_l) in bodies.iter().zip(&case_labels) {
            let tmp_ref = ast.ident(tmp.clone());
            let cmp = ast.binary(BinaryOp::StrictEq, tmp_ref, *test);
            let goto = ast.goto(case_l.clone());
            let cond = ast.if_stmt(cmp, goto, None);
            self.current_body.push(cond);
        }
        self.end_chunk(ast, &after_l, case_labels[0].clone());

        for (i, (_, stmts)) in bodies.iter().enumerate() {
            self.process_statements(ast, cx, stmts)?;
            let next = case_labels
                .get(i + 1)
                .cloned()
                .unwrap_or_else(|| after_l.clone());
            self.end_chunk(ast, &after_l, next);
        }
        Ok(true)
    }
}

/// The statement list of a branch: a block's body, or the statement itself.
fn statements_of(ast: &Ast, stmt: NodeId) -> Vec<NodeId> {
    match block_body(ast, stmt) {
        Some(body) => body.to_vec(),
        None => vec![stmt],
    }
}

/// Plans break/continue retargeting for a labeled loop body.
///
/// Returns the jumps to rewrite (node, goto target), or `None` when any jump
/// targets a different label — in that case the structure is kept verbatim.
/// Unlabeled jumps are rewritten only when they bind to this loop: `break`
/// binds the nearest breakable, `continue` the nearest loop.
fn plan_jump_rewrites(
    ast: &Ast,
    loop_body: NodeId,
    label: &str,
    after: &str,
    update: &str,
) -> Option<Vec<(NodeId, String)>> {
    let mut out = Vec::new();
    let mut ok = true;
    collect_jumps(ast, loop_body, 0, 0, label, after, update, &mut out, &mut ok);
    ok.then_some(out)
}

#[allow(clippy::too_many_arguments)]
fn collect_jumps(
    ast: &Ast,
    id: NodeId,
    breakable_depth: usize,
    loop_depth: usize,
    label: &str,
    after: &str,
    update: &str,
    out: &mut Vec<(NodeId, String)>,
    ok: &mut bool,
) {
    if !*ok {
        return;
    }
    match ast.kind(id) {
        NodeKind::FunctionDeclaration(_)
        | NodeKind::FunctionExpression(_)
        | NodeKind::ArrowFunctionExpression(_) => {}
        NodeKind::BreakStatement { label: l } => match l {
            None => {
                if breakable_depth == 0 {
                    out.push((id, after.to_string()));
                }
            }
            Some(l) => {
                if ast.ident_name(*l) == Some(label) {
                    out.push((id, after.to_string()));
                } else {
                    *ok = false;
                }
            }
        },
        NodeKind::ContinueStatement { label: l } => match l {
            None => {
                if loop_depth == 0 {
                    out.push((id, update.to_string()));
                }
            }
            Some(l) => {
                if ast.ident_name(*l) == Some(label) {
                    out.push((id, update.to_string()));
                } else {
                    *ok = false;
                }
            }
        },
        NodeKind::WhileStatement { .. }
        | NodeKind::DoWhileStatement { .. }
        | NodeKind::ForStatement { .. } => {
            for child in ast.children_of(id) {
                collect_jumps(
                    ast,
                    child,
                    breakable_depth + 1,
                    loop_depth + 1,
                    label,
                    after,
                    update,
                    out,
                    ok,
                );
            }
        }
        NodeKind::SwitchStatement { .. } => {
            for child in ast.children_of(id) {
                collect_jumps(
                    ast,
                    child,
                    breakable_depth + 1,
                    loop_depth,
                    label,
                    after,
                    update,
                    out,
                    ok,
                );
            }
        }
        _ => {
            for child in ast.children_of(id) {
                collect_jumps(
                    ast,
                    child,
                    breakable_depth,
                    loop_depth,
                    label,
                    after,
                    update,
                    out,
                    ok,
                );
            }
        }
    }
}

/// True if the statement holds a jump that would lose its target when the
/// surrounding labeled switch is dissolved.
fn contains_unstructured_jump(ast: &Ast, root: NodeId, label: &str) -> bool {
    let mut found = false;
    check_jumps(ast, root, 0, label, &mut found);
    found
}

fn check_jumps(ast: &Ast, id: NodeId, breakable_depth: usize, label: &str, found: &mut bool) {
    if *found {
        return;
    }
    match ast.kind(id) {
        NodeKind::FunctionDeclaration(_)
        | NodeKind::FunctionExpression(_)
        | NodeKind::ArrowFunctionExpression(_) => {}
        NodeKind::BreakStatement { label: l } => match l {
            None => {
                if breakable_depth == 0 {
                    *found = true;
                }
            }
            Some(l) => {
                if ast.ident_name(*l) == Some(label) {
                    *found = true;
                }
            }
        },
        NodeKind::ContinueStatement { label: l } => {
            if let Some(l) = l {
                if ast.ident_name(*l) == Some(label) {
                    *found = true;
                }
            }
        }
        NodeKind::WhileStatement { .. }
        | NodeKind::DoWhileStatement { .. }
        | NodeKind::ForStatement { .. }
        | NodeKind::SwitchStatement { .. } => {
            for child in ast.children_of(id) {
                check_jumps(ast, child, breakable_depth + 1, label, found);
            }
        }
        _ => {
            for child in ast.children_of(id) {
                check_jumps(ast, child, breakable_depth, label, found);
            }
        }
    }
}

/// Unlabeled `break`/`continue` directly at a block's statement level (not
/// inside a nested breakable) would re-bind to the generated dispatch switch;
/// such blocks are ineligible for flattening.
pub(crate) fn has_naked_jumps(ast: &Ast, block: NodeId) -> bool {
    let Some(body) = block_body(ast, block) else {
        return false;
    };
    let mut found = false;
    for stmt in body {
        naked_jump_scan(ast, *stmt, 0, 0, &mut found);
        if found {
            return true;
        }
    }
    false
}

fn naked_jump_scan(
    ast: &Ast,
    id: NodeId,
    breakable_depth: usize,
    loop_depth: usize,
    found: &mut bool,
) {
    if *found {
        return;
    }
    match ast.kind(id) {
        NodeKind::FunctionDeclaration(_)
        | NodeKind::FunctionExpression(_)
        | NodeKind::ArrowFunctionExpression(_) => {}
        NodeKind::BreakStatement { label: None } => {
            if breakable_depth == 0 {
                *found = true;
            }
        }
        NodeKind::ContinueStatement { label: None } => {
            if loop_depth == 0 {
                *found = true;
            }
        }
        NodeKind::WhileStatement { .. }
        | NodeKind::DoWhileStatement { .. }
        | NodeKind::ForStatement { .. } => {
            for child in ast.children_of(id) {
                naked_jump_scan(ast, child, breakable_depth + 1, loop_depth + 1, found);
            }
        }
        NodeKind::SwitchStatement { .. } => {
            for child in ast.children_of(id) {
                naked_jump_scan(ast, child, breakable_depth + 1, loop_depth, found);
            }
        }
        _ => {
            for child in ast.children_of(id) {
                naked_jump_scan(ast, child, breakable_depth, loop_depth, found);
            }
        }
    }
}
