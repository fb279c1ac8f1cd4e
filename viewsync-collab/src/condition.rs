//! Client-evaluable command preconditions.
//!
//! A condition is a small boolean expression over named flags, e.g.
//! `"isEnabled && !isBusy || isAdmin"`. The same text is evaluated by the
//! server before executing a command and shipped to clients so they can
//! disable affordances without a round trip.
//!
//! Grammar (no parentheses): `||` binds loosest, then `&&`, then a leading
//! `!`. The empty string means "always".

/// Parsed condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    True,
    Flag(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    Parse(String),
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionError::Parse(text) => write!(f, "Parsing '{text}' failed"),
        }
    }
}

impl std::error::Error for ConditionError {}

impl Default for Condition {
    fn default() -> Self {
        Condition::True
    }
}

impl Condition {
    /// Parse `text`, accepting only flag names for which `is_known` holds.
    pub fn parse(text: &str, is_known: impl Fn(&str) -> bool) -> Result<Self, ConditionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Condition::True);
        }
        Self::parse_expr(trimmed, &is_known)
    }

    fn parse_expr(text: &str, is_known: &dyn Fn(&str) -> bool) -> Result<Self, ConditionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConditionError::Parse(text.to_string()));
        }
        if let Some(i) = text.find("||") {
            let left = Self::parse_expr(&text[..i], is_known).map_err(|_| Self::failed(text))?;
            let right = Self::parse_expr(&text[i + 2..], is_known).map_err(|_| Self::failed(text))?;
            return Ok(Condition::Or(Box::new(left), Box::new(right)));
        }
        if let Some(i) = text.find("&&") {
            let left = Self::parse_expr(&text[..i], is_known).map_err(|_| Self::failed(text))?;
            let right = Self::parse_expr(&text[i + 2..], is_known).map_err(|_| Self::failed(text))?;
            return Ok(Condition::And(Box::new(left), Box::new(right)));
        }
        if let Some(rest) = text.strip_prefix('!') {
            let inner = Self::parse_expr(rest, is_known).map_err(|_| Self::failed(text))?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        if is_known(text) {
            return Ok(Condition::Flag(text.to_string()));
        }
        Err(Self::failed(text))
    }

    fn failed(text: &str) -> ConditionError {
        ConditionError::Parse(text.to_string())
    }

    /// Evaluate with `flag` resolving each flag name.
    pub fn evaluate(&self, flag: &mut dyn FnMut(&str) -> bool) -> bool {
        match self {
            Condition::True => true,
            Condition::Flag(name) => flag(name),
            Condition::Not(inner) => !inner.evaluate(flag),
            Condition::And(left, right) => left.evaluate(flag) && right.evaluate(flag),
            Condition::Or(left, right) => left.evaluate(flag) || right.evaluate(flag),
        }
    }

    /// Flag names referenced by this condition.
    pub fn flags(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_flags(&mut names);
        names
    }

    fn collect_flags<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Condition::True => {}
            Condition::Flag(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Condition::Not(inner) => inner.collect_flags(names),
            Condition::And(left, right) | Condition::Or(left, right) => {
                left.collect_flags(names);
                right.collect_flags(names);
            }
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::True => Ok(()),
            Condition::Flag(name) => write!(f, "{name}"),
            Condition::Not(inner) => write!(f, "!{inner}"),
            Condition::And(left, right) => write!(f, "{left} && {right}"),
            Condition::Or(left, right) => write!(f, "{left} || {right}"),
        }
    }
}
