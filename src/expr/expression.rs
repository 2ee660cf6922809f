//! Shunting-yard evaluator for the `[[ ... ]]` arithmetic markers.
//!
//! Parentheses add a constant offset to the priority of every operator
//! nested within them, so deeply nested groups never collide with the base
//! priority range; see `original_source/expression.cpp`, which uses the same
//! `+10`-per-level scheme this module adopts verbatim.

const PAREN_OFFSET: i32 = 10;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    Func(String),
    LParen,
    RParen,
}

/// Parses and evaluates an arithmetic expression. Returns `NaN` on any
/// parse error: unbalanced parens, empty parens, unknown token, or arity
/// mismatch.
pub fn evaluate_expression(input: &str) -> f64 {
    let Some(tokens) = tokenize(input) else {
        return f64::NAN;
    };
    let Some(postfix) = to_postfix(&tokens) else {
        return f64::NAN;
    };
    eval_postfix(&postfix).unwrap_or(f64::NAN)
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(text.parse().ok()?));
            continue;
        }
        if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_alphanumeric() {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            tokens.push(Token::Func(name));
            continue;
        }
        match c {
            '+' | '-' | '*' | '/' | '^' => {
                let is_unary_minus = c == '-'
                    && matches!(
                        tokens.last(),
                        None | Some(Token::Op(_)) | Some(Token::LParen)
                    );
                if is_unary_minus {
                    tokens.push(Token::Number(0.0));
                }
                tokens.push(Token::Op(c));
            }
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            _ => return None,
        }
        i += 1;
    }

    Some(tokens)
}

fn base_priority(op: char) -> i32 {
    match op {
        '+' | '-' => 1,
        '*' | '/' => 2,
        '^' => 3,
        _ => 0,
    }
}

#[derive(Clone, Debug)]
enum StackEntry {
    Op(char, i32),
    Func(String),
    LParen,
}

fn to_postfix(tokens: &[Token]) -> Option<Vec<Token>> {
    let mut output = Vec::new();
    let mut ops: Vec<StackEntry> = Vec::new();
    let mut offset = 0;

    for token in tokens {
        match token {
            Token::Number(_) => output.push(token.clone()),
            Token::Func(name) => ops.push(StackEntry::Func(name.clone())),
            Token::LParen => {
                ops.push(StackEntry::LParen);
                offset += PAREN_OFFSET;
            }
            Token::RParen => {
                let mut saw_paren = false;
                while let Some(entry) = ops.pop() {
                    match entry {
                        StackEntry::LParen => {
                            saw_paren = true;
                            break;
                        }
                        StackEntry::Op(c, _) => output.push(Token::Op(c)),
                        StackEntry::Func(name) => output.push(Token::Func(name)),
                    }
                }
                if !saw_paren {
                    return None;
                }
                offset -= PAREN_OFFSET;
                if let Some(StackEntry::Func(_)) = ops.last() {
                    if let Some(StackEntry::Func(name)) = ops.pop() {
                        output.push(Token::Func(name));
                    }
                }
            }
            Token::Op(c) => {
                let priority = base_priority(*c) + offset;
                let right_associative = *c == '^';
                while let Some(StackEntry::Op(_, top_priority)) = ops.last() {
                    let should_pop = if right_associative {
                        *top_priority > priority
                    } else {
                        *top_priority >= priority
                    };
                    if !should_pop {
                        break;
                    }
                    if let Some(StackEntry::Op(top, _)) = ops.pop() {
                        output.push(Token::Op(top));
                    }
                }
                ops.push(StackEntry::Op(*c, priority));
            }
        }
    }

    while let Some(entry) = ops.pop() {
        match entry {
            StackEntry::LParen => return None,
            StackEntry::Op(c, _) => output.push(Token::Op(c)),
            StackEntry::Func(name) => output.push(Token::Func(name)),
        }
    }

    Some(output)
}

fn eval_postfix(postfix: &[Token]) -> Option<f64> {
    let mut stack: Vec<f64> = Vec::new();

    for token in postfix {
        match token {
            Token::Number(n) => stack.push(*n),
            Token::Op(c) => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                stack.push(match c {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    '/' => a / b,
                    '^' => a.powf(b),
                    _ => return None,
                });
            }
            Token::Func(name) => {
                let x = stack.pop()?;
                stack.push(apply_function(name, x)?);
            }
            Token::LParen | Token::RParen => return None,
        }
    }

    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

fn apply_function(name: &str, x: f64) -> Option<f64> {
    Some(match name {
        "sqrt" => x.sqrt(),
        "log" => x.log10(),
        "ln" => x.ln(),
        "exp" => x.exp(),
        "cosd" => x.to_radians().cos(),
        "cosr" => x.cos(),
        "coshd" => x.to_radians().cosh(),
        "coshr" => x.cosh(),
        "acosd" => x.acos().to_degrees(),
        "acosr" => x.acos(),
        "sind" => x.to_radians().sin(),
        "sinr" => x.sin(),
        "sinhd" => x.to_radians().sinh(),
        "sinhr" => x.sinh(),
        "asind" => x.asin().to_degrees(),
        "asinr" => x.asin(),
        "tgd" => x.to_radians().tan(),
        "tgr" => x.tan(),
        "tghd" => x.to_radians().tanh(),
        "tghr" => x.tanh(),
        "atgd" => x.atan().to_degrees(),
        "atgr" => x.atan(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_precedence() {
        assert_eq!(evaluate_expression("2 + 3 * 4"), 14.0);
    }

    #[test]
    fn parens_override_precedence() {
        assert_eq!(evaluate_expression("(2 + 3) * 4"), 20.0);
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(evaluate_expression("2 ^ 3 ^ 2"), 2f64.powf(9.0));
    }

    #[test]
    fn unary_minus_rewritten_via_leading_zero() {
        assert_eq!(evaluate_expression("-5 + 2"), -3.0);
    }

    #[test]
    fn unbalanced_parens_yield_nan() {
        assert!(evaluate_expression("(2 + 3").is_nan());
        assert!(evaluate_expression("2 + 3)").is_nan());
    }

    #[test]
    fn unknown_function_yields_nan() {
        assert!(evaluate_expression("frobnicate(2)").is_nan());
    }

    #[test]
    fn function_call() {
        assert_eq!(evaluate_expression("sqrt(16)"), 4.0);
    }
}
