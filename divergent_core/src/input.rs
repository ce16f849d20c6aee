pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;

    /// Hex MD5 of the raw bytes, used to tag findings for reproduction.
    fn digest_hex(&self) -> String {
        format!("{:x}", md5::compute(self.as_bytes()))
    }
}

impl Input for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

/// Splits an input into its `;`-terminated statements.
///
/// Semicolons inside single- or double-quoted literals do not end a
/// statement. Blank statements are dropped and each returned statement is
/// trimmed, without its terminator.
pub fn split_statements(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in text.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ';') => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    statements.push(trimmed.to_string());
                }
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}

/// Joins statements back into a single `;`-terminated input.
pub fn join_statements<S: AsRef<str>>(statements: &[S]) -> Vec<u8> {
    let mut out = String::new();
    for (i, stmt) in statements.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(stmt.as_ref());
        out.push(';');
    }
    out.into_bytes()
}
