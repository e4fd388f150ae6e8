use crate::ast::{
    Expr, ExprKind, Ident, Literal, Module, Param, Part, Slice, Stmt, StmtInner, Strings, Wire,
};

peg::parser! { pub grammar hdl() for str {

    rule _() = quiet!{([' ' | '\t' | '\r' | '\n']+ / "//" [^'\n']* / "/*" (!"*/" [_])* "*/")*}

    // Identifiers are maximal runs of non-delimiter characters that don't
    // start with a digit; the structural symbols and whitespace delimit.
    rule ident_char() = [^ '{' | '}' | '(' | ')' | '[' | ']' | ',' | '.' | '-' | '>' | ':' | '/' | ' ' | '\t' | '\r' | '\n']

    rule ident(ctx: &mut Strings) -> Ident =
        quiet!{name:$((!['0'..='9'] ident_char()) ident_char()*) _ {?
            match name {
                // reserved keywords
                "module" | "test" | "clock" => Err("identifier"),
                _ => Ok(ctx.intern(name)),
            }
        }} / expected!("identifier")

    rule int() -> usize =
        quiet!{n:$(['0'..='9']+) _ {? n.parse().or(Err("integer")) }} / expected!("integer")

    rule literal() -> Literal =
        "0b" n:$(['0'..='9']+) _ {? n.parse().map(Literal::Byte).or(Err("integer")) } /
        "0w" n:$(['0'..='9']+) _ {? n.parse().map(Literal::Word).or(Err("integer")) } /
        n:int() {? u32::try_from(n).map(Literal::Int).or(Err("integer")) }

    rule slice() -> Slice =
        "[" _ start:int() end:(".." _ e:int() {e})? "]" _ { Slice { start, end } }

    pub rule file(ctx: &mut Strings) -> Vec<Module> = _ modules:module(ctx)* ![_] { modules }

    rule module(ctx: &mut Strings) -> Module =
        pos:position!() "module" !ident_char() _ name:ident(ctx)
        "(" _ params:(param(ctx) ** ("," _)) ")" _ "->" _
        outputs:(param(ctx) ++ ("," _))
        "{" _ body:stmt(ctx)* "}" _
        { Module { pos, name, params, outputs, body } }

    rule param(ctx: &mut Strings) -> Param =
        pos:position!() name:ident(ctx) slice:slice()? { Param { pos, name, slice } }

    rule stmt(ctx: &mut Strings) -> Stmt =
        pos:position!() inner:stmt_inner(ctx) { Stmt { pos, inner } }

    rule stmt_inner(ctx: &mut Strings) -> StmtInner =
        part:part(ctx) { StmtInner::Part(part) } /
        wire:wire(ctx) { StmtInner::Wire(wire) }

    rule part(ctx: &mut Strings) -> Part =
        label:(l:ident(ctx) ":" _ {l})?
        module:ident(ctx) "(" _ inputs:exprs(ctx)? ")" _ "->" _ outputs:exprs(ctx)
        { Part { label, module, inputs: inputs.unwrap_or_default(), outputs } }

    // Several wire inputs must be bound with {}; a lone input may omit them.
    rule wire(ctx: &mut Strings) -> Wire =
        inputs:wire_inputs(ctx) "->" _ output:expr(ctx) { Wire { inputs, output } }

    rule wire_inputs(ctx: &mut Strings) -> Vec<Expr> =
        "{" _ items:exprs(ctx) "}" _ { items } /
        e:expr(ctx) { vec![e] }

    rule exprs(ctx: &mut Strings) -> Vec<Expr> = expr(ctx) ++ ("," _)

    rule expr(ctx: &mut Strings) -> Expr =
        pos:position!() kind:expr_kind(ctx) { Expr { pos, kind } }

    rule expr_kind(ctx: &mut Strings) -> ExprKind =
        "{" _ items:exprs(ctx) "}" _ { ExprKind::Group(items) } /
        lit:literal() { ExprKind::Literal(lit) } /
        name:ident(ctx) slice:slice()? { ExprKind::Name { name, slice } }
}}
