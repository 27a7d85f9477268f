//! GML parser: tokens to AST.
//!
//! Recursive descent following the operator precedence ladder (ternary at
//! the bottom, postfix member/index/call at the top).

use crate::ast::*;
use crate::error::{GmlError, GmlResult};
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::value::Value;

pub struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
}

impl Parser {
    pub fn new(source: &str) -> GmlResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    /// Parse a full GML block.
    pub fn parse(&mut self) -> GmlResult<Script> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.parse_statement()?);
            // Statements may be separated by newlines (already consumed by
            // the lexer), commas or semicolons.
            while matches!(self.peek(), Some(Token::Comma) | Some(Token::Semicolon)) {
                self.advance();
            }
        }
        Ok(Script { statements })
    }

    /// Parse a single expression; trailing tokens are an error.
    pub fn parse_expression_only(&mut self) -> GmlResult<Expression> {
        let expr = self.parse_expression()?;
        if !self.is_at_end() {
            return Err(self.error("unexpected trailing tokens after expression"));
        }
        Ok(expr)
    }

    fn parse_statement(&mut self) -> GmlResult<Statement> {
        if self.check(&Token::Return) {
            self.advance();
            return Ok(Statement::Return(self.parse_expression()?));
        }

        // Assignment: identifier directly followed by a single `=`.
        if let (Some(Token::Ident(name)), Some(Token::Assign)) =
            (self.peek().cloned(), self.peek_at(1))
        {
            self.advance(); // ident
            self.advance(); // '='
            let expression = self.parse_expression()?;
            let is_temp = name.starts_with('$');
            return Ok(Statement::Assignment(Assignment {
                field: name,
                is_temp,
                expression,
            }));
        }

        Ok(Statement::Expression(self.parse_expression()?))
    }

    fn parse_expression(&mut self) -> GmlResult<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> GmlResult<Expression> {
        let condition = self.parse_or()?;
        if self.check(&Token::Question) {
            self.advance();
            let then_branch = self.parse_expression()?;
            self.expect(&Token::Colon)?;
            let else_branch = self.parse_expression()?;
            return Ok(Expression::Ternary {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_and()?;
        loop {
            let op = match self.peek() {
                Some(Token::Or) => BinaryOp::Or,
                Some(Token::Coalesce) => BinaryOp::NullCoalesce,
                _ => break,
            };
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_equality()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expression::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                Some(Token::StrictEq) => BinaryOp::StrictEq,
                Some(Token::StrictNe) => BinaryOp::StrictNe,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::In) => BinaryOp::In,
                Some(Token::Like) => BinaryOp::Like,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> GmlResult<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> GmlResult<Expression> {
        let op = match self.peek() {
            Some(Token::Not) => Some(UnaryOp::Not),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Plus) => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> GmlResult<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) | Some(Token::QuestionDot) => {
                    let optional = matches!(self.peek(), Some(Token::QuestionDot));
                    self.advance();
                    let Some(Token::Ident(name)) = self.peek().cloned() else {
                        return Err(self.error("expected identifier after '.'"));
                    };
                    self.advance();
                    if self.check(&Token::LParen) {
                        self.advance();
                        let args = self.parse_args()?;
                        self.expect(&Token::RParen)?;
                        expr = Expression::MethodCall {
                            target: Box::new(expr),
                            method: name,
                            args,
                            optional,
                        };
                    } else {
                        expr = match expr {
                            // Plain dotted access on an identifier chain
                            // stays a variable path so scope lookup sees
                            // the full name.
                            Expression::Variable(mut path) if !optional => {
                                path.push(name);
                                Expression::Variable(path)
                            }
                            target => Expression::Member {
                                target: Box::new(target),
                                name,
                                optional,
                            },
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expression::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> GmlResult<Expression> {
        match self.peek().cloned() {
            Some(Token::Null) => {
                self.advance();
                Ok(Expression::Literal(Value::Null))
            }
            Some(Token::Bool(b)) => {
                self.advance();
                Ok(Expression::Literal(Value::Bool(b)))
            }
            Some(Token::Int(i)) => {
                self.advance();
                Ok(Expression::Literal(Value::Int(i)))
            }
            Some(Token::Float(f)) => {
                self.advance();
                Ok(Expression::Literal(Value::Float(f)))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expression::Literal(Value::String(s)))
            }
            Some(Token::Template(t)) => {
                self.advance();
                self.parse_template(&t)
            }
            Some(Token::This) => {
                self.advance();
                let mut path = Vec::new();
                while self.check(&Token::Dot) {
                    // A call like `this.items.map(...)` must leave the final
                    // segment for the postfix loop.
                    if matches!(self.peek_at(2), Some(Token::LParen)) {
                        break;
                    }
                    self.advance();
                    let Some(Token::Ident(name)) = self.peek().cloned() else {
                        return Err(self.error("expected identifier after 'this.'"));
                    };
                    self.advance();
                    path.push(name);
                }
                Ok(Expression::This(path))
            }
            Some(Token::Spread) => {
                self.advance();
                let expr = self.parse_postfix()?;
                Ok(Expression::Spread(Box::new(expr)))
            }
            Some(Token::Case) => self.parse_case(),
            Some(Token::Ident(name)) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expression::FunctionCall { name, args })
                } else if self.check(&Token::Arrow) {
                    self.advance();
                    let body = self.parse_expression()?;
                    Ok(Expression::Lambda {
                        params: vec![name],
                        body: Box::new(body),
                    })
                } else {
                    Ok(Expression::Variable(vec![name]))
                }
            }
            Some(Token::LParen) => {
                if let Some(params) = self.try_lambda_params() {
                    let body = self.parse_expression()?;
                    return Ok(Expression::Lambda {
                        params,
                        body: Box::new(body),
                    });
                }
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&Token::RBracket) && !self.is_at_end() {
                    elements.push(self.parse_expression()?);
                    if !self.check(&Token::RBracket) {
                        self.expect(&Token::Comma)?;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expression::ArrayLiteral(elements))
            }
            Some(Token::LBrace) => {
                self.advance();
                let mut fields = Vec::new();
                while !self.check(&Token::RBrace) && !self.is_at_end() {
                    fields.push(self.parse_object_field()?);
                    if self.check(&Token::Comma) {
                        self.advance();
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expression::ObjectLiteral(fields))
            }
            Some(Token::Eof) | None => Err(self.error("unexpected end of input")),
            Some(other) => Err(self.error(&format!("unexpected token {:?}", other))),
        }
    }

    /// Detect `(a, b) => ...` without consuming anything on failure.
    /// Returns the parameter list with the tokens through `=>` consumed.
    fn try_lambda_params(&mut self) -> Option<Vec<String>> {
        let mut pos = self.position + 1; // past '('
        let mut params = Vec::new();
        loop {
            match self.tokens.get(pos).map(|t| &t.token) {
                Some(Token::Ident(name)) => {
                    params.push(name.clone());
                    pos += 1;
                    match self.tokens.get(pos).map(|t| &t.token) {
                        Some(Token::Comma) => pos += 1,
                        Some(Token::RParen) => {
                            pos += 1;
                            break;
                        }
                        _ => return None,
                    }
                }
                Some(Token::RParen) if params.is_empty() => {
                    pos += 1;
                    break;
                }
                _ => return None,
            }
        }
        if matches!(self.tokens.get(pos).map(|t| &t.token), Some(Token::Arrow)) {
            self.position = pos + 1;
            Some(params)
        } else {
            None
        }
    }

    fn parse_case(&mut self) -> GmlResult<Expression> {
        self.expect(&Token::Case)?;
        let mut branches = Vec::new();
        let mut else_branch = None;
        loop {
            if self.check(&Token::When) {
                self.advance();
                let when = self.parse_expression()?;
                self.expect(&Token::Then)?;
                let then = self.parse_expression()?;
                branches.push(CaseBranch { when, then });
            } else if self.check(&Token::Else) {
                self.advance();
                else_branch = Some(Box::new(self.parse_expression()?));
                break;
            } else if self.check(&Token::End) {
                break;
            } else {
                return Err(self.error("expected WHEN, ELSE or END in CASE expression"));
            }
        }
        self.expect(&Token::End)?;
        Ok(Expression::Case {
            branches,
            else_branch,
        })
    }

    fn parse_object_field(&mut self) -> GmlResult<ObjectField> {
        if self.check(&Token::Spread) {
            self.advance();
            let expr = self.parse_postfix()?;
            return Ok(ObjectField::Spread(expr));
        }

        let name = match self.peek().cloned() {
            Some(Token::Ident(name)) => name,
            Some(Token::Str(name)) => name,
            _ => return Err(self.error("expected field name in object literal")),
        };
        self.advance();

        // Both `field: expr` and the legacy `field = expr` are accepted.
        if self.check(&Token::Colon) || self.check(&Token::Assign) {
            self.advance();
            let value = self.parse_expression()?;
            Ok(ObjectField::Named { name, value })
        } else {
            Ok(ObjectField::Shorthand(name))
        }
    }

    fn parse_args(&mut self) -> GmlResult<Vec<Expression>> {
        let mut args = Vec::new();
        while !self.check(&Token::RParen) && !self.is_at_end() {
            args.push(self.parse_expression()?);
            if !self.check(&Token::RParen) {
                self.expect(&Token::Comma)?;
            }
        }
        Ok(args)
    }

    fn parse_template(&mut self, template: &str) -> GmlResult<Expression> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            if ch == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{'
                if !current.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut current)));
                }

                let mut expr_src = String::new();
                let mut depth = 1;
                for c in chars.by_ref() {
                    match c {
                        '{' => {
                            depth += 1;
                            expr_src.push(c);
                        }
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            expr_src.push(c);
                        }
                        _ => expr_src.push(c),
                    }
                }
                if depth != 0 {
                    return Err(self.error("unterminated ${...} interpolation"));
                }

                let mut sub = Parser::new(&expr_src)?;
                let expr = sub.parse_expression_only()?;
                parts.push(TemplatePart::Expression(expr));
            } else if ch == '\\' {
                match chars.next() {
                    Some('n') => current.push('\n'),
                    Some('t') => current.push('\t'),
                    Some('r') => current.push('\r'),
                    Some(c) => current.push(c),
                    None => {}
                }
            } else {
                current.push(ch);
            }
        }

        if !current.is_empty() {
            parts.push(TemplatePart::Literal(current));
        }

        Ok(Expression::Template(parts))
    }

    // Helpers

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<&Token> {
        if !self.is_at_end() {
            self.position += 1;
        }
        self.tokens.get(self.position - 1).map(|t| &t.token)
    }

    fn check(&self, token: &Token) -> bool {
        self.peek()
            .map(|t| std::mem::discriminant(t) == std::mem::discriminant(token))
            .unwrap_or(false)
    }

    fn expect(&mut self, token: &Token) -> GmlResult<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", token)))
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), Some(Token::Eof) | None)
    }

    fn error(&self, message: &str) -> GmlError {
        let (line, column) = self
            .tokens
            .get(self.position)
            .map(|t| (t.line, t.column))
            .unwrap_or((0, 0));
        GmlError::Parse {
            line,
            column,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Script {
        Parser::new(src).unwrap().parse().unwrap()
    }

    #[test]
    fn test_parse_assignment() {
        let script = parse("name = user.name");
        assert_eq!(script.statements.len(), 1);
        assert!(matches!(&script.statements[0], Statement::Assignment(a) if a.field == "name"));
    }

    #[test]
    fn test_parse_temp_assignment() {
        let script = parse("$tmp = 1");
        assert!(matches!(&script.statements[0], Statement::Assignment(a) if a.is_temp));
    }

    #[test]
    fn test_parse_statement_separators() {
        assert_eq!(parse("a = 1, b = 2, c = 3").statements.len(), 3);
        assert_eq!(parse("a = 1; b = 2").statements.len(), 2);
        assert_eq!(parse("a = 1\nb = 2").statements.len(), 2);
    }

    #[test]
    fn test_parse_ternary_and_case() {
        parse("x > 0 ? 'positive' : 'negative'");
        parse("CASE WHEN x >= 90 THEN 'A' WHEN x >= 60 THEN 'B' ELSE 'F' END");
    }

    #[test]
    fn test_parse_strict_and_coalesce() {
        let script = parse("a === b ?? c");
        assert_eq!(script.statements.len(), 1);
    }

    #[test]
    fn test_parse_in_like() {
        parse("x IN [1, 2, 3]");
        parse("name LIKE 'A%'");
        parse("NOT (a AND b) OR c");
    }

    #[test]
    fn test_parse_chained_methods() {
        let script = parse("items.filter(x => x.active).map(x => x.name)");
        assert!(matches!(
            &script.statements[0],
            Statement::Expression(Expression::MethodCall { method, .. }) if method == "map"
        ));
    }

    #[test]
    fn test_parse_optional_chaining() {
        let script = parse("user?.profile");
        assert!(matches!(
            &script.statements[0],
            Statement::Expression(Expression::Member { optional: true, .. })
        ));
        parse("user?.load(1)");
    }

    #[test]
    fn test_parse_multi_param_lambda() {
        let script = parse("(acc, item) => acc + item.price");
        assert!(matches!(
            &script.statements[0],
            Statement::Expression(Expression::Lambda { params, .. }) if params.len() == 2
        ));
    }

    #[test]
    fn test_parenthesized_expression_not_lambda() {
        let script = parse("(a + b) * 2");
        assert!(matches!(
            &script.statements[0],
            Statement::Expression(Expression::Binary { op: BinaryOp::Mul, .. })
        ));
    }

    #[test]
    fn test_parse_object_literal_both_syntaxes() {
        parse("{ name: 'test', value = 42, shorthand, ...rest }");
    }

    #[test]
    fn test_parse_index() {
        parse("arr[0]");
        parse("arr[-1]");
        parse("obj['key']");
        parse("matrix[i][j]");
    }

    #[test]
    fn test_parse_template_interpolation() {
        let script = parse("`total: ${items.sum('price')}`");
        let Statement::Expression(Expression::Template(parts)) = &script.statements[0] else {
            panic!("expected template");
        };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_parse_spread_statement() {
        let script = parse("...customer\norders = orderCount");
        assert_eq!(script.statements.len(), 2);
        assert!(matches!(
            &script.statements[0],
            Statement::Expression(Expression::Spread(_))
        ));
    }

    #[test]
    fn test_parse_error_has_position() {
        let err = Parser::new("a = ").unwrap().parse().unwrap_err();
        assert!(matches!(err, GmlError::Parse { .. }));
    }
}
