//! Owner and mode specification parsing
//!
//! Owners are `user` or `user:group`. Modes are octal (`755`, `0755`,
//! `0o755`) or absolute symbolic clauses such as `u=rwx,g=rx,o=`. Classes
//! a symbolic mode does not mention end up with no permissions.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1, take_while_m_n};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{pair, preceded, separated_pair};
use nom::IResult;

use crate::error::ParseError;
use crate::{Mode, Target};

fn name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ':' && !c.is_whitespace())(input)
}

fn owner(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    pair(name, opt(preceded(char(':'), name)))(input)
}

/// Parse `user` or `user:group` into an owner target
pub fn parse_owner(input: &str) -> Result<Target, ParseError> {
    let (_, (user, group)) = all_consuming(owner)(input.trim())
        .map_err(|_| ParseError::InvalidOwner(input.to_string()))?;

    Ok(Target::Owner {
        user: user.to_string(),
        group: group.map(str::to_string),
    })
}

fn octal(input: &str) -> IResult<&str, u32> {
    map_res(
        preceded(
            opt(alt((tag("0o"), tag("0O")))),
            take_while_m_n(1, 4, |c: char| c.is_digit(8)),
        ),
        |digits| u32::from_str_radix(digits, 8),
    )(input)
}

fn clause(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| "ugoa".contains(c)),
        char('='),
        take_while(|c: char| "rwxst".contains(c)),
    )(input)
}

/// Bits granted to one class (`u`, `g` or `o`) by a permission string
fn class_bits(class: char, perms: &str) -> u32 {
    let shift = match class {
        'u' => 6,
        'g' => 3,
        _ => 0,
    };
    let mut bits = 0;
    for perm in perms.chars() {
        bits |= match (perm, class) {
            ('r', _) => 0o4 << shift,
            ('w', _) => 0o2 << shift,
            ('x', _) => 0o1 << shift,
            ('s', 'u') => 0o4000,
            ('s', 'g') => 0o2000,
            ('t', 'o') => 0o1000,
            _ => 0,
        };
    }
    bits
}

/// Everything a class owns, special bit included
fn class_mask(class: char) -> u32 {
    match class {
        'u' => 0o4700,
        'g' => 0o2070,
        _ => 0o1007,
    }
}

fn symbolic(input: &str) -> IResult<&str, u32> {
    map(separated_list1(char(','), clause), |clauses| {
        let mut bits = 0;
        for (who, perms) in clauses {
            for class in who.chars().flat_map(|c| match c {
                'a' => vec!['u', 'g', 'o'],
                c => vec![c],
            }) {
                bits = (bits & !class_mask(class)) | class_bits(class, perms);
            }
        }
        bits
    })(input)
}

/// Parse an octal or absolute symbolic mode
pub fn parse_mode(input: &str) -> Result<Mode, ParseError> {
    let (_, bits) = all_consuming(alt((octal, symbolic)))(input.trim())
        .map_err(|_| ParseError::InvalidMode(input.to_string()))?;
    Ok(Mode::from_bits(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_forms() {
        assert_eq!(parse_owner("carol").unwrap(), Target::owner("carol"));
        assert_eq!(
            parse_owner("carol:staff").unwrap(),
            Target::Owner {
                user: "carol".into(),
                group: Some("staff".into())
            }
        );
        assert_eq!(parse_owner(" 1000:1000 ").unwrap(), Target::Owner {
            user: "1000".into(),
            group: Some("1000".into())
        });
    }

    #[test]
    fn test_owner_rejects_malformed() {
        for bad in [":staff", "carol:", "", "a:b:c", "car ol"] {
            assert_eq!(
                parse_owner(bad),
                Err(ParseError::InvalidOwner(bad.to_string())),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_octal_modes() {
        assert_eq!(parse_mode("755").unwrap().bits(), 0o755);
        assert_eq!(parse_mode("0644").unwrap().bits(), 0o644);
        assert_eq!(parse_mode("0o700").unwrap().bits(), 0o700);
        assert_eq!(parse_mode("4755").unwrap().bits(), 0o4755);
    }

    #[test]
    fn test_symbolic_modes() {
        assert_eq!(parse_mode("u=rwx,g=rx,o=").unwrap().bits(), 0o750);
        assert_eq!(parse_mode("a=r").unwrap().bits(), 0o444);
        assert_eq!(parse_mode("a=rx,u=rwx").unwrap().bits(), 0o755);
        assert_eq!(parse_mode("u=rwxs,o=t").unwrap().bits(), 0o5700);
        assert_eq!(parse_mode("ug=rw").unwrap().bits(), 0o660);
    }

    #[test]
    fn test_mode_rejects_malformed() {
        for bad in ["888", "07777x", "12345", "u+x", "u=rwz", "", "0o"] {
            assert!(
                matches!(parse_mode(bad), Err(ParseError::InvalidMode(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
