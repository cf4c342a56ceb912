//! Constructor helpers for building AST nodes.
//!
//! Passes synthesize a lot of small expressions; these builders keep that
//! code readable. Each returns the id of a freshly allocated node.

use super::{
    AssignOp, Ast, BinaryOp, DeclKind, Function, Literal, LogicalOp, NodeId, NodeKind, PropertyKind,
    UnaryOp,
};

impl Ast {
    pub fn ident(&mut self, name: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Identifier { name: name.into() })
    }

    pub fn number(&mut self, value: f64) -> NodeId {
        self.alloc(NodeKind::Literal(Literal::Number(value)))
    }

    /// An integer literal; negative values are wrapped in unary minus so the
    /// printer never has to emit a negative numeric token.
    pub fn int(&mut self, value: i64) -> NodeId {
        if value < 0 {
            let inner = self.number(-(value as f64));
            self.unary(UnaryOp::Minus, inner)
        } else {
            self.number(value as f64)
        }
    }

    pub fn string(&mut self, value: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Literal(Literal::String(value.into())))
    }

    pub fn bool_lit(&mut self, value: bool) -> NodeId {
        self.alloc(NodeKind::Literal(Literal::Boolean(value)))
    }

    pub fn null_lit(&mut self) -> NodeId {
        self.alloc(NodeKind::Literal(Literal::Null))
    }

    pub fn undefined(&mut self) -> NodeId {
        self.ident("undefined")
    }

    pub fn this_expr(&mut self) -> NodeId {
        self.alloc(NodeKind::ThisExpression)
    }

    pub fn program(&mut self, body: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::Program { body })
    }

    pub fn block(&mut self, body: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::BlockStatement { body })
    }

    pub fn expr_stmt(&mut self, expression: NodeId) -> NodeId {
        self.alloc(NodeKind::ExpressionStatement { expression })
    }

    pub fn ret(&mut self, argument: Option<NodeId>) -> NodeId {
        self.alloc(NodeKind::ReturnStatement { argument })
    }

    pub fn throw_new_error(&mut self, message: &str) -> NodeId {
        let callee = self.ident("Error");
        let msg = self.string(message);
        let err = self.alloc(NodeKind::NewExpression {
            callee,
            arguments: vec![msg],
        });
        self.alloc(NodeKind::ThrowStatement { argument: err })
    }

    pub fn if_stmt(&mut self, test: NodeId, consequent: NodeId, alternate: Option<NodeId>) -> NodeId {
        self.alloc(NodeKind::IfStatement {
            test,
            consequent,
            alternate,
        })
    }

    pub fn while_stmt(&mut self, test: NodeId, body: NodeId) -> NodeId {
        self.alloc(NodeKind::WhileStatement { test, body })
    }

    pub fn labeled(&mut self, label: impl Into<String>, body: NodeId) -> NodeId {
        let label = self.ident(label);
        self.alloc(NodeKind::LabeledStatement { label, body })
    }

    pub fn break_stmt(&mut self, label: Option<&str>) -> NodeId {
        let label = label.map(|l| self.ident(l));
        self.alloc(NodeKind::BreakStatement { label })
    }

    pub fn continue_stmt(&mut self, label: Option<&str>) -> NodeId {
        let label = label.map(|l| self.ident(l));
        self.alloc(NodeKind::ContinueStatement { label })
    }

    pub fn goto(&mut self, label: impl Into<String>) -> NodeId {
        self.alloc(NodeKind::Goto {
            label: label.into(),
        })
    }

    pub fn switch_case(&mut self, test: Option<NodeId>, consequent: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::SwitchCase { test, consequent })
    }

    pub fn switch_stmt(&mut self, discriminant: NodeId, cases: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::SwitchStatement {
            discriminant,
            cases,
        })
    }

    /// `var <name> = <init>;` as a single-declarator declaration.
    pub fn var_decl(&mut self, name: impl Into<String>, init: Option<NodeId>) -> NodeId {
        let id = self.ident(name);
        let declarator = self.alloc(NodeKind::VariableDeclarator { id, init });
        self.alloc(NodeKind::VariableDeclaration {
            kind: DeclKind::Var,
            declarations: vec![declarator],
        })
    }

    /// `var [<names…>] = <init>;` destructuring a value into a pattern.
    pub fn var_array_pattern(&mut self, elements: Vec<NodeId>, init: NodeId) -> NodeId {
        let pattern = self.alloc(NodeKind::ArrayPattern { elements });
        let declarator = self.alloc(NodeKind::VariableDeclarator {
            id: pattern,
            init: Some(init),
        });
        self.alloc(NodeKind::VariableDeclaration {
            kind: DeclKind::Var,
            declarations: vec![declarator],
        })
    }

    pub fn var_decl_multi(&mut self, declarators: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::VariableDeclaration {
            kind: DeclKind::Var,
            declarations: declarators,
        })
    }

    pub fn declarator(&mut self, name: impl Into<String>, init: Option<NodeId>) -> NodeId {
        let id = self.ident(name);
        self.alloc(NodeKind::VariableDeclarator { id, init })
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(NodeKind::BinaryExpression { op, left, right })
    }

    pub fn logical(&mut self, op: LogicalOp, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(NodeKind::LogicalExpression { op, left, right })
    }

    pub fn unary(&mut self, op: UnaryOp, argument: NodeId) -> NodeId {
        self.alloc(NodeKind::UnaryExpression { op, argument })
    }

    pub fn assign(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(NodeKind::AssignmentExpression {
            op: AssignOp::Assign,
            left,
            right,
        })
    }

    pub fn assign_op(&mut self, op: AssignOp, left: NodeId, right: NodeId) -> NodeId {
        self.alloc(NodeKind::AssignmentExpression { op, left, right })
    }

    pub fn cond(&mut self, test: NodeId, consequent: NodeId, alternate: NodeId) -> NodeId {
        self.alloc(NodeKind::ConditionalExpression {
            test,
            consequent,
            alternate,
        })
    }

    pub fn seq(&mut self, expressions: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::SequenceExpression { expressions })
    }

    pub fn call(&mut self, callee: NodeId, arguments: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::CallExpression { callee, arguments })
    }

    pub fn new_expr(&mut self, callee: NodeId, arguments: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::NewExpression { callee, arguments })
    }

    /// `<object>.<name>` with a plain identifier property.
    pub fn member(&mut self, object: NodeId, name: impl Into<String>) -> NodeId {
        let property = self.ident(name);
        self.alloc(NodeKind::MemberExpression {
            object,
            property,
            computed: false,
        })
    }

    /// `<object>[<property>]`.
    pub fn computed_member(&mut self, object: NodeId, property: NodeId) -> NodeId {
        self.alloc(NodeKind::MemberExpression {
            object,
            property,
            computed: true,
        })
    }

    pub fn array(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::ArrayExpression { elements })
    }

    pub fn object(&mut self, properties: Vec<NodeId>) -> NodeId {
        self.alloc(NodeKind::ObjectExpression { properties })
    }

    /// A string-keyed init property: `"<key>": <value>`.
    pub fn property(&mut self, key: impl Into<String>, value: NodeId) -> NodeId {
        let key = self.string(key);
        self.alloc(NodeKind::Property {
            key,
            value,
            computed: false,
            kind: PropertyKind::Init,
        })
    }

    pub fn func_expr(&mut self, id: Option<NodeId>, params: Vec<NodeId>, body: NodeId) -> NodeId {
        self.alloc(NodeKind::FunctionExpression(Function {
            id,
            params,
            body,
            is_async: false,
            is_generator: false,
            expression_body: false,
        }))
    }

    pub fn func_decl(&mut self, name: impl Into<String>, params: Vec<NodeId>, body: NodeId) -> NodeId {
        let id = self.ident(name);
        self.alloc(NodeKind::FunctionDeclaration(Function {
            id: Some(id),
            params,
            body,
            is_async: false,
            is_generator: false,
            expression_body: false,
        }))
    }

    pub fn await_expr(&mut self, argument: NodeId) -> NodeId {
        self.alloc(NodeKind::AwaitExpression { argument })
    }

    /// `Array.prototype.slice.call(<target>, <from>)`.
    pub fn slice_call(&mut self, target: NodeId, from: i64) -> NodeId {
        let array = self.ident("Array");
        let proto = self.member(array, "prototype");
        let slice = self.member(proto, "slice");
        let call = self.member(slice, "call");
        let from = self.int(from);
        self.call(call, vec![target, from])
    }

    /// `Array.prototype.slice.call(<target>)`.
    pub fn slice_call_all(&mut self, target: NodeId) -> NodeId {
        let array = self.ident("Array");
        let proto = self.member(array, "prototype");
        let slice = self.member(proto, "slice");
        let call = self.member(slice, "call");
        self.call(call, vec![target])
    }

    /// `typeof <argument>`.
    pub fn typeof_expr(&mut self, argument: NodeId) -> NodeId {
        self.unary(UnaryOp::Typeof, argument)
    }
}
