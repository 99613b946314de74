//! The textual metadata format exported by managed modules.
//!
//! A metadata blob is line-structured: one physical line per type. Each line
//! starts with a run of one-letter flags terminated by `[`, then
//! `[namespace]Name$size;`, then zero or more member entries, each terminated
//! by `;`, up to the newline that closes the type. Member entries are either
//! `.ctor`, `.entr` (the assembly entry point), or a plain method; field
//! declarations (`.fldv`) are not supported and abort the load.
//!
//! Parsing is fail-fast: malformed input produces a [`MetadataError`] with
//! the byte offset of the problem, and the surrounding read/load aborts.
//!
//! The reader yields *raw* members: argument and return types are unresolved
//! name strings. The loader resolves them against the read assemblies' type
//! tables during phase-2 load, where it also binds each member to its
//! positional slot in the module's address table.

use crate::assembly::Assembly;
use crate::error::MetadataError;
use crate::types::members::MemberKind;
use crate::types::{Modifiers, TypeKind};

/// Parsed type header: everything on a type line before the member entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHeader {
    pub kind: TypeKind,
    pub modifiers: Modifiers,
    /// Brackets retained exactly as written: `[Namespace]Name`.
    pub qualified_name: String,
    pub size: usize,
}

/// One member entry with unresolved type names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMember {
    Constructor {
        modifiers: Modifiers,
        args: Vec<String>,
    },
    EntryPoint {
        modifiers: Modifiers,
        return_type: String,
        name: String,
        args: Vec<String>,
    },
    Method {
        modifiers: Modifiers,
        return_type: String,
        name: String,
        args: Vec<String>,
    },
}

/// Byte cursor over a metadata blob.
pub struct MetaReader<'m> {
    meta: &'m str,
    pos: usize,
}

impl<'m> MetaReader<'m> {
    pub fn new(meta: &'m str) -> Self {
        Self { meta, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.meta.len()
    }

    fn peek(&self) -> Option<u8> {
        self.meta.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn eof(&self, expected: char) -> MetadataError {
        MetadataError::UnexpectedEof {
            offset: self.meta.len(),
            expected,
        }
    }

    /// Consumes up to and including `terminator`, returning the bytes before
    /// it. All terminators in the grammar are ASCII, so slicing is safe.
    fn take_until(&mut self, terminator: u8) -> Result<&'m str, MetadataError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(c) if c == terminator => {
                    let token = &self.meta[start..self.pos];
                    self.bump();
                    return Ok(token);
                }
                Some(_) => self.bump(),
                None => return Err(self.eof(terminator as char)),
            }
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), MetadataError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(MetadataError::UnexpectedChar {
                offset: self.pos,
                expected: expected as char,
                found: c as char,
            }),
            None => Err(self.eof(expected as char)),
        }
    }

    fn eat_prefix(&mut self, prefix: &str) -> bool {
        if self.meta.as_bytes()[self.pos..].starts_with(prefix.as_bytes()) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Parses a type header. Unrecognized flag characters are ignored;
    /// absence of a visibility flag defaults to `PRIVATE`.
    pub fn read_type_header(&mut self) -> Result<TypeHeader, MetadataError> {
        let mut modifiers = Modifiers::PRIVATE;
        let mut kind = TypeKind::Class;
        loop {
            match self.peek().ok_or_else(|| self.eof('['))? {
                b'[' => break,
                b'p' => modifiers |= Modifiers::PUBLIC,
                b's' => modifiers |= Modifiers::STATIC,
                b'd' => modifiers |= Modifiers::SEALED,
                b'a' => modifiers |= Modifiers::ABSTRACT,
                b'i' => modifiers |= Modifiers::INTERNAL,
                b't' => modifiers |= Modifiers::PROTECTED,
                b'l' => modifiers |= Modifiers::PARTIAL,
                b'c' => kind = TypeKind::Class,
                b'v' => kind = TypeKind::Struct,
                b'r' => modifiers |= Modifiers::READONLY,
                _ => {}
            }
            self.bump();
        }
        self.bump(); // '['
        let namespace = self.take_until(b']')?;
        let name = self.take_until(b'$')?;
        let size_offset = self.pos;
        let size_text = self.take_until(b';')?;
        let size = size_text
            .parse::<usize>()
            .map_err(|_| MetadataError::InvalidSize {
                offset: size_offset,
                text: size_text.to_string(),
            })?;
        if modifiers.contains(Modifiers::READONLY) && kind == TypeKind::Struct {
            kind = TypeKind::ReadonlyStruct;
        }
        Ok(TypeHeader {
            kind,
            modifiers,
            qualified_name: format!("[{namespace}]{name}"),
            size,
        })
    }

    /// Skips the remainder of the current type line, including the newline
    /// sentinel. Used by phase-1 reads, which only want headers.
    pub fn skip_members(&mut self) -> Result<(), MetadataError> {
        loop {
            match self.peek() {
                Some(b'\n') => {
                    self.bump();
                    return Ok(());
                }
                Some(_) => self.bump(),
                None => return Err(self.eof('\n')),
            }
        }
    }

    /// Parses the next member entry on the current type line, or consumes
    /// the newline sentinel and returns `None`.
    pub fn next_member(&mut self) -> Result<Option<RawMember>, MetadataError> {
        match self.peek() {
            Some(b'\n') => {
                self.bump();
                return Ok(None);
            }
            Some(_) => {}
            None => return Err(self.eof('\n')),
        }

        if self.eat_prefix(".ctor ") {
            let mut modifiers = Modifiers::PRIVATE | Modifiers::STATIC;
            loop {
                match self.peek().ok_or_else(|| self.eof('('))? {
                    b'(' => break,
                    b'p' => modifiers |= Modifiers::PUBLIC,
                    b'i' => modifiers |= Modifiers::INTERNAL,
                    b't' => modifiers |= Modifiers::PROTECTED,
                    b'r' => modifiers |= Modifiers::READONLY,
                    _ => {}
                }
                self.bump();
            }
            self.bump(); // '('
            let args = self.parse_args()?;
            self.expect(b';')?;
            return Ok(Some(RawMember::Constructor { modifiers, args }));
        }

        if self.eat_prefix(".entr ") {
            let mut modifiers = Modifiers::PRIVATE;
            loop {
                match self.peek().ok_or_else(|| self.eof('['))? {
                    b'[' => break,
                    b'p' => modifiers |= Modifiers::PUBLIC,
                    b'i' => modifiers |= Modifiers::INTERNAL,
                    b't' => modifiers |= Modifiers::PROTECTED,
                    b's' => modifiers |= Modifiers::STATIC,
                    _ => {}
                }
                self.bump();
            }
            self.bump(); // '['
            let namespace = self.take_until(b']')?;
            let return_name = self.take_until(b' ')?;
            let name = self.take_until(b'(')?;
            let args = self.parse_args()?;
            self.expect(b';')?;
            return Ok(Some(RawMember::EntryPoint {
                modifiers,
                return_type: format!("[{namespace}]{return_name}"),
                name: name.to_string(),
                args,
            }));
        }

        if self.meta.as_bytes()[self.pos..].starts_with(b".fldv ") {
            return Err(MetadataError::FieldDecl { offset: self.pos });
        }

        let mut modifiers = Modifiers::PRIVATE;
        loop {
            match self.peek().ok_or_else(|| self.eof('['))? {
                b'[' => break,
                b'p' => modifiers |= Modifiers::PUBLIC,
                b'i' => modifiers |= Modifiers::INTERNAL,
                b't' => modifiers |= Modifiers::PROTECTED,
                b'a' => modifiers |= Modifiers::ABSTRACT,
                b's' => modifiers |= Modifiers::STATIC,
                _ => {}
            }
            self.bump();
        }
        self.bump(); // '['
        let namespace = self.take_until(b']')?;
        let return_name = self.take_until(b' ')?;
        let name = self.take_until(b'(')?;
        let args = self.parse_args()?;
        self.expect(b';')?;
        Ok(Some(RawMember::Method {
            modifiers,
            return_type: format!("[{namespace}]{return_name}"),
            name: name.to_string(),
            args,
        }))
    }

    /// Comma-separated argument list up to the closing `)`. Tokens are raw
    /// qualified type names; an empty list yields zero arguments.
    fn parse_args(&mut self) -> Result<Vec<String>, MetadataError> {
        let mut args = Vec::new();
        loop {
            if self.peek().ok_or_else(|| self.eof(')'))? == b')' {
                self.bump();
                return Ok(args);
            }
            let start = self.pos;
            loop {
                match self.peek() {
                    Some(b',') | Some(b')') => break,
                    Some(_) => self.bump(),
                    None => return Err(self.eof(')')),
                }
            }
            args.push(self.meta[start..self.pos].to_string());
            if self.peek() == Some(b',') {
                self.bump();
            }
        }
    }
}

/// Counts the non-field member entries in a blob: the required length of the
/// module's address table. Shares the member productions with `next_member`
/// so a blob that fails here would also fail the load.
pub fn count_code_members(meta: &str) -> Result<usize, MetadataError> {
    let mut reader = MetaReader::new(meta);
    let mut count = 0;
    while !reader.at_end() {
        reader.read_type_header()?;
        while reader.next_member()?.is_some() {
            count += 1;
        }
    }
    Ok(count)
}

fn render_flags(out: &mut String, modifiers: Modifiers, include: &[(Modifiers, char)]) {
    for (flag, c) in include {
        if modifiers.contains(*flag) {
            out.push(*c);
        }
    }
}

const TYPE_FLAGS: &[(Modifiers, char)] = &[
    (Modifiers::PUBLIC, 'p'),
    (Modifiers::STATIC, 's'),
    (Modifiers::SEALED, 'd'),
    (Modifiers::ABSTRACT, 'a'),
    (Modifiers::INTERNAL, 'i'),
    (Modifiers::PROTECTED, 't'),
    (Modifiers::PARTIAL, 'l'),
];

const CTOR_FLAGS: &[(Modifiers, char)] = &[
    (Modifiers::PUBLIC, 'p'),
    (Modifiers::INTERNAL, 'i'),
    (Modifiers::PROTECTED, 't'),
    (Modifiers::READONLY, 'r'),
];

const METHOD_FLAGS: &[(Modifiers, char)] = &[
    (Modifiers::PUBLIC, 'p'),
    (Modifiers::INTERNAL, 'i'),
    (Modifiers::PROTECTED, 't'),
    (Modifiers::ABSTRACT, 'a'),
    (Modifiers::STATIC, 's'),
];

/// Re-serializes an assembly's type/member graph back into the textual
/// grammar. Destructors, fields, and properties have no textual production
/// and are skipped; array types are synthesized rather than declared and are
/// skipped too. Parsing the result yields a structurally identical graph.
pub fn render(assembly: &Assembly) -> String {
    let mut out = String::new();
    for ty in assembly.types_in_order() {
        if ty.kind == TypeKind::Array {
            continue;
        }
        render_flags(&mut out, ty.modifiers, TYPE_FLAGS);
        match ty.kind {
            TypeKind::Struct | TypeKind::ReadonlyStruct => out.push('v'),
            _ => out.push('c'),
        }
        if ty.modifiers.contains(Modifiers::READONLY) {
            out.push('r');
        }
        out.push_str(&ty.qualified_name);
        out.push_str(&format!("${};", ty.size));

        let mut members = ty.static_members();
        members.extend(ty.instance_members());
        // declaration order is recoverable from the positional address
        // binding; members attached outside the metadata walk sort last
        members.sort_by_key(|m| {
            m.code_addr()
                .and_then(|addr| assembly.addresses.iter().position(|&a| a == addr))
                .unwrap_or(usize::MAX)
        });
        for member in members {
            match &member.kind {
                MemberKind::Constructor { signature, .. } => {
                    out.push_str(".ctor ");
                    render_flags(&mut out, member.modifiers, CTOR_FLAGS);
                    out.push('(');
                    let args: Vec<_> =
                        signature.iter().map(|t| t.qualified_name.clone()).collect();
                    out.push_str(&args.join(","));
                    out.push_str(");");
                }
                MemberKind::Method { signature, addr } => {
                    if assembly.entry_point() == Some(*addr) {
                        out.push_str(".entr ");
                    }
                    render_flags(&mut out, member.modifiers, METHOD_FLAGS);
                    let (args, ret) = signature.split_at(signature.len().saturating_sub(1));
                    if let Some(ret) = ret.first() {
                        out.push_str(&ret.qualified_name);
                    }
                    out.push(' ');
                    out.push_str(&member.name);
                    out.push('(');
                    let args: Vec<_> = args.iter().map(|t| t.qualified_name.clone()).collect();
                    out.push_str(&args.join(","));
                    out.push_str(");");
                }
                MemberKind::Destructor { .. }
                | MemberKind::Field { .. }
                | MemberKind::Property { .. } => {}
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(meta: &str) -> TypeHeader {
        MetaReader::new(meta).read_type_header().unwrap()
    }

    #[test]
    fn header_flags() {
        let h = header("psdaitl c[My.Ns]Widget$48;\n");
        assert_eq!(h.kind, TypeKind::Class);
        assert!(h.modifiers.contains(
            Modifiers::PUBLIC
                | Modifiers::STATIC
                | Modifiers::SEALED
                | Modifiers::ABSTRACT
                | Modifiers::INTERNAL
                | Modifiers::PROTECTED
                | Modifiers::PARTIAL
        ));
        assert_eq!(h.qualified_name, "[My.Ns]Widget");
        assert_eq!(h.size, 48);
    }

    #[test]
    fn visibility_defaults_to_private() {
        let h = header("c[N]A$8;\n");
        assert!(h.modifiers.contains(Modifiers::PRIVATE));
        assert!(!h.modifiers.contains(Modifiers::PUBLIC));
    }

    #[test]
    fn readonly_struct_fuses_kind() {
        assert_eq!(header("pvr[N]S$16;\n").kind, TypeKind::ReadonlyStruct);
        assert_eq!(header("pv[N]S$16;\n").kind, TypeKind::Struct);
        // readonly on a class stays a class
        assert_eq!(header("pcr[N]C$16;\n").kind, TypeKind::Class);
    }

    #[test]
    fn header_errors_are_fail_fast() {
        assert!(matches!(
            MetaReader::new("pc").read_type_header(),
            Err(MetadataError::UnexpectedEof { expected: '[', .. })
        ));
        assert!(matches!(
            MetaReader::new("pc[N]A$16").read_type_header(),
            Err(MetadataError::UnexpectedEof { expected: ';', .. })
        ));
        assert!(matches!(
            MetaReader::new("pc[N]A$zap;").read_type_header(),
            Err(MetadataError::InvalidSize { .. })
        ));
    }

    fn members_of(meta: &str) -> Vec<RawMember> {
        let mut reader = MetaReader::new(meta);
        reader.read_type_header().unwrap();
        let mut out = vec![];
        while let Some(m) = reader.next_member().unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn constructor_entry_is_static_by_default() {
        let members = members_of("pc[N]A$16;.ctor p([N]A,[N]B);\n");
        match &members[0] {
            RawMember::Constructor { modifiers, args } => {
                assert!(modifiers.contains(Modifiers::PUBLIC | Modifiers::STATIC));
                assert_eq!(args, &["[N]A".to_string(), "[N]B".to_string()]);
            }
            other => panic!("expected constructor, got {other:?}"),
        }
    }

    #[test]
    fn entry_point_production() {
        let members = members_of("pc[N]Program$16;.entr ps[System]Int32 Main([System]String[]);\n");
        match &members[0] {
            RawMember::EntryPoint {
                modifiers,
                return_type,
                name,
                args,
            } => {
                assert!(modifiers.contains(Modifiers::PUBLIC | Modifiers::STATIC));
                assert_eq!(return_type, "[System]Int32");
                assert_eq!(name, "Main");
                assert_eq!(args, &["[System]String[]".to_string()]);
            }
            other => panic!("expected entry point, got {other:?}"),
        }
    }

    #[test]
    fn plain_methods_and_empty_args() {
        let members = members_of("pc[N]A$16;ps[System]Void Reset();p[System]Int32 Get([N]A);\n");
        match &members[0] {
            RawMember::Method {
                modifiers,
                name,
                args,
                ..
            } => {
                assert!(modifiers.contains(Modifiers::STATIC));
                assert_eq!(name, "Reset");
                assert!(args.is_empty());
            }
            other => panic!("expected method, got {other:?}"),
        }
        match &members[1] {
            RawMember::Method {
                modifiers, name, ..
            } => {
                assert!(!modifiers.contains(Modifiers::STATIC));
                assert_eq!(name, "Get");
            }
            other => panic!("expected method, got {other:?}"),
        }
    }

    #[test]
    fn field_decl_is_fatal() {
        let mut reader = MetaReader::new("pc[N]A$16;.fldv p[System]Int32 X;\n");
        reader.read_type_header().unwrap();
        assert!(matches!(
            reader.next_member(),
            Err(MetadataError::FieldDecl { .. })
        ));
    }

    #[test]
    fn member_block_requires_newline_sentinel() {
        let mut reader = MetaReader::new("pc[N]A$16;");
        reader.read_type_header().unwrap();
        assert!(matches!(
            reader.next_member(),
            Err(MetadataError::UnexpectedEof { expected: '\n', .. })
        ));
    }

    #[test]
    fn render_tolerates_empty_method_signatures() {
        use crate::assembly::{Assembly, LocalsTable};
        use crate::types::members::Member;
        use crate::types::Type;

        let assembly = Assembly::in_memory("test.dll", "", &[], LocalsTable::empty());
        let ty = Type::new(TypeKind::Class, "test.dll", "[N]Odd", Modifiers::PUBLIC, 16).leak();
        ty.attach_static(Member::method(
            "Weird",
            Modifiers::PUBLIC | Modifiers::STATIC,
            vec![],
            0x10,
        ));
        assembly.register_type(ty);
        assert!(render(&assembly).contains("Weird"));
    }

    #[test]
    fn counts_members_across_type_lines() {
        let meta = "pc[N]A$16;.ctor p();p[N]A Get();\npc[N]B$8;\npc[N]C$8;ps[N]B Make([N]A,[N]B);\n";
        assert_eq!(count_code_members(meta).unwrap(), 3);
    }
}
