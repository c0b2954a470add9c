//! Textual module parser.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::core::{PassError, PassResult};
use crate::ir::{AttrValue, Attributes, CallKind, CompId, CustomCall, InstId, Module, OpKind, Opcode, PrimitiveType, Shape};

/// Parses a module in the textual format.
pub fn parse_module(text: &str) -> PassResult<Module> {
    let parser = Parser::new(text);
    parser.parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,

    // Module-wide map
    computations: HashMap<&'a str, CompId>,

    // Per-computation maps
    values: HashMap<&'a str, InstId>,
    control_resolves: Vec<Resolve<'a>>,
}

/// A control predecessor named before its definition.
#[derive(Debug)]
struct Resolve<'a> {
    name: &'a str,
    line: usize,
    successor: InstId,
}

/// Attributes that follow the operand list of an instruction.
#[derive(Debug, Default)]
struct InstAttrs<'a> {
    index: Option<usize>,
    to: Option<&'a str>,
    kind: Option<CallKind>,
    sharding: Option<i64>,
    target: Option<String>,
    attrs: Attributes,
    control_predecessors: Vec<&'a str>,
    metadata: Option<String>,
    backend_config: Option<String>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::new("module"),
            computations: HashMap::new(),
            values: HashMap::new(),
            control_resolves: Vec::new(),
        }
    }

    fn parse(mut self) -> PassResult<Module> {
        self.skip_whitespace();
        if self.peek_keyword("module") {
            self.read_identifier()?;
            let name = self.read_name()?;
            self.module = Module::new(name);
        }

        self.skip_whitespace();
        while !self.is_eof() {
            if let Err(e) = self.parse_computation() {
                log::debug!("parse failed near {:?}", self.context());
                return Err(e);
            }
            self.skip_whitespace();
        }

        if self.module.entry().is_none() {
            return Err(self.error("module has no entry computation"));
        }
        Ok(self.module)
    }

    // ---------------------------------------------------------------------
    // Lexing
    // ---------------------------------------------------------------------

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn context(&self) -> &'a str {
        let end = self.text[self.pos..].find('\n').map_or(self.text.len(), |n| self.pos + n);
        &self.text[self.pos..end]
    }

    fn error(&self, message: impl Into<String>) -> PassError {
        PassError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Skip comment line
                while let Some(ch) = self.current_char() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> PassResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!("expected '{}' but found {:?}", ch, self.current_char())));
        }
        Ok(())
    }

    fn is_ident_char(ch: char) -> bool {
        ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-' | ':')
    }

    fn read_identifier(&mut self) -> PassResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphanumeric() || ch == '_' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{}'", ch))),
            None => return Err(self.error("expected identifier but found EOF")),
        }
        while let Some(ch) = self.current_char() {
            if Self::is_ident_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    /// `%name`
    fn read_name(&mut self) -> PassResult<&'a str> {
        self.expect('%')?;
        self.read_identifier()
    }

    fn peek_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        let rest = &self.text[self.pos..];
        rest.starts_with(keyword)
            && !rest[keyword.len()..].chars().next().is_some_and(Self::is_ident_char)
    }

    fn read_integer(&mut self) -> PassResult<i64> {
        self.skip_whitespace();
        let start = self.pos;
        if self.current_char() == Some('-') {
            self.advance();
        }
        while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let digits = &self.text[start..self.pos];
        digits
            .parse()
            .map_err(|e| self.error(format!("failed to parse number {:?}: {}", digits, e)))
    }

    fn read_index(&mut self) -> PassResult<usize> {
        let value = self.read_integer()?;
        usize::try_from(value).map_err(|_| self.error(format!("expected a non-negative index, got {}", value)))
    }

    fn read_string(&mut self) -> PassResult<String> {
        self.expect('"')?;
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch == '"' {
                let s = self.text[start..self.pos].to_string();
                self.advance();
                return Ok(s);
            }
            self.advance();
        }
        Err(self.error("unterminated string"))
    }

    // ---------------------------------------------------------------------
    // Shapes
    // ---------------------------------------------------------------------

    fn parse_shape(&mut self) -> PassResult<Shape> {
        if self.try_read('(') {
            let mut elements = Vec::new();
            if !self.try_read(')') {
                loop {
                    elements.push(self.parse_shape()?);
                    if self.try_read(')') {
                        break;
                    }
                    self.expect(',')?;
                }
            }
            return Ok(Shape::tuple(elements));
        }

        self.skip_whitespace();
        let start = self.pos;
        while self.current_char().is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.advance();
        }
        let ty_name = &self.text[start..self.pos];
        let element_type = PrimitiveType::from_name(ty_name)
            .ok_or_else(|| self.error(format!("unknown element type '{}'", ty_name)))?;
        self.expect('[')?;
        let mut dims = Vec::new();
        if !self.try_read(']') {
            loop {
                dims.push(self.read_integer()?);
                if self.try_read(']') {
                    break;
                }
                self.expect(',')?;
            }
        }
        Ok(Shape::Array { element_type, dims })
    }

    // ---------------------------------------------------------------------
    // Computations
    // ---------------------------------------------------------------------

    fn parse_computation(&mut self) -> PassResult<()> {
        let is_entry = self.peek_keyword("entry");
        if is_entry {
            self.read_identifier()?;
        }
        let keyword = self.read_identifier()?;
        if keyword != "computation" {
            return Err(self.error(format!("expected 'computation' but found '{}'", keyword)));
        }
        let name = self.read_name()?;
        if self.computations.contains_key(name) {
            return Err(self.error(format!("duplicate computation '%{}'", name)));
        }
        let comp = self.module.add_computation(name);
        self.computations.insert(name, comp);

        // Reset per-computation state
        self.values.clear();
        self.control_resolves.clear();

        self.expect('{')?;
        let mut root = None;
        let mut last = None;
        while !self.try_read('}') {
            if self.is_eof() {
                return Err(self.error(format!("unterminated computation '%{}'", name)));
            }
            let is_root = self.peek_keyword("ROOT");
            if is_root {
                self.read_identifier()?;
            }
            let inst = self.parse_instruction(comp)?;
            if is_root {
                if root.is_some() {
                    return Err(self.error(format!("computation '%{}' has more than one ROOT", name)));
                }
                root = Some(inst);
            }
            last = Some(inst);
        }

        let root = root
            .or(last)
            .ok_or_else(|| self.error(format!("computation '%{}' is empty", name)))?;
        self.module.set_root(comp, root);
        if is_entry {
            if self.module.entry().is_some() {
                return Err(self.error("more than one entry computation"));
            }
            self.module.set_entry(comp);
        }

        self.resolve_control_predecessors()
    }

    fn resolve_control_predecessors(&mut self) -> PassResult<()> {
        for resolve in std::mem::take(&mut self.control_resolves) {
            let pred = self.values.get(resolve.name).copied().ok_or_else(|| PassError::Parse {
                line: resolve.line,
                message: format!("unknown control predecessor '%{}'", resolve.name),
            })?;
            self.module.add_control_dependency(pred, resolve.successor)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Instructions
    // ---------------------------------------------------------------------

    fn parse_instruction(&mut self, comp: CompId) -> PassResult<InstId> {
        let line = self.line();
        let name = self.read_name()?;
        if self.values.contains_key(name) {
            return Err(self.error(format!("redefinition of '%{}'", name)));
        }
        self.expect('=')?;
        let shape = self.parse_shape()?;
        let op_name = self.read_identifier()?;
        let kind = match op_name {
            "exp" => OpKind::Exp,
            other => OpKind::from_name(other).ok_or_else(|| self.error(format!("unknown opcode '{}'", other)))?,
        };

        // Operand list; parameters and constants carry their payload instead.
        self.expect('(')?;
        let mut payload = None;
        let mut operands = Vec::new();
        match kind {
            OpKind::Parameter => {
                payload = Some(self.read_index()?.to_string());
                self.expect(')')?;
            }
            OpKind::Constant => {
                self.skip_whitespace();
                let start = self.pos;
                while self.current_char().is_some_and(|c| c != ')' && c != '\n') {
                    self.advance();
                }
                payload = Some(self.text[start..self.pos].trim().to_string());
                self.expect(')')?;
            }
            _ => {
                if !self.try_read(')') {
                    loop {
                        let operand = self.read_name()?;
                        let id = self
                            .values
                            .get(operand)
                            .copied()
                            .ok_or_else(|| self.error(format!("use of undefined value '%{}'", operand)))?;
                        operands.push(id);
                        if self.try_read(')') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
            }
        }

        let attrs = self.parse_attributes()?;
        let opcode = self.build_opcode(kind, payload, &attrs)?;
        let id = self.module.add_instruction(comp, opcode, shape, operands, Some(name));
        self.module.set_sharding(id, attrs.sharding);
        self.module.set_metadata(id, attrs.metadata);
        self.module.set_backend_config(id, attrs.backend_config);
        for pred in attrs.control_predecessors {
            self.control_resolves.push(Resolve {
                name: pred,
                line,
                successor: id,
            });
        }
        self.values.insert(name, id);
        Ok(id)
    }

    fn build_opcode(&self, kind: OpKind, payload: Option<String>, attrs: &InstAttrs<'a>) -> PassResult<Opcode> {
        Ok(match kind {
            OpKind::Parameter => {
                let number = payload
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| self.error("parameter without a number"))?;
                Opcode::Parameter(number)
            }
            OpKind::Constant => Opcode::Constant(payload.unwrap_or_default()),
            OpKind::GetTupleElement => {
                Opcode::GetTupleElement(attrs.index.ok_or_else(|| self.error("get-tuple-element needs index="))?)
            }
            OpKind::Call => {
                let to = attrs.to.ok_or_else(|| self.error("call needs to="))?;
                let computation = self
                    .computations
                    .get(to)
                    .copied()
                    .ok_or_else(|| self.error(format!("call to undefined computation '%{}'", to)))?;
                Opcode::Call {
                    computation,
                    kind: attrs.kind.clone().unwrap_or(CallKind::Plain),
                }
            }
            OpKind::CustomCall => {
                let target = attrs.target.clone().ok_or_else(|| self.error("custom-call needs target="))?;
                Opcode::CustomCall(CustomCall {
                    target,
                    attributes: attrs.attrs.clone(),
                })
            }
            other => Opcode::from_kind(other).ok_or_else(|| self.error(format!("opcode '{}' needs a payload", other)))?,
        })
    }

    fn parse_attributes(&mut self) -> PassResult<InstAttrs<'a>> {
        let mut attrs = InstAttrs::default();
        while self.try_read(',') {
            let key = self.read_identifier()?;
            self.expect('=')?;
            match key {
                "index" => attrs.index = Some(self.read_index()?),
                "to" => attrs.to = Some(self.read_name()?),
                "kind" => {
                    let text = self.read_identifier()?;
                    let kind = CallKind::parse(text).ok_or_else(|| self.error(format!("unknown call kind '{}'", text)))?;
                    attrs.kind = Some(kind);
                }
                "sharding" => attrs.sharding = Some(self.read_integer()?),
                "target" => attrs.target = Some(self.read_string()?),
                "metadata" => attrs.metadata = Some(self.read_string()?),
                "backend-config" => attrs.backend_config = Some(self.read_string()?),
                "attrs" => attrs.attrs = self.parse_attr_map()?,
                "control-predecessors" => {
                    self.expect('{')?;
                    if !self.try_read('}') {
                        loop {
                            attrs.control_predecessors.push(self.read_name()?);
                            if self.try_read('}') {
                                break;
                            }
                            self.expect(',')?;
                        }
                    }
                }
                other => return Err(self.error(format!("unknown attribute '{}'", other))),
            }
        }
        Ok(attrs)
    }

    /// `{key=value, ...}`
    fn parse_attr_map(&mut self) -> PassResult<Attributes> {
        let mut map = Attributes::new();
        self.expect('{')?;
        if self.try_read('}') {
            return Ok(map);
        }
        loop {
            let key = self.read_identifier()?;
            self.expect('=')?;
            let value = self.parse_attr_value()?;
            map.insert(key.to_string(), value);
            if self.try_read('}') {
                return Ok(map);
            }
            self.expect(',')?;
        }
    }

    fn parse_attr_value(&mut self) -> PassResult<AttrValue> {
        self.skip_whitespace();
        match self.current_char() {
            Some('"') => Ok(AttrValue::Str(self.read_string()?)),
            Some('[') => {
                self.advance();
                let mut items = Vec::new();
                if !self.try_read(']') {
                    loop {
                        items.push(self.read_integer()?);
                        if self.try_read(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(AttrValue::IntList(items))
            }
            Some('{') => {
                self.advance();
                let mut map = BTreeMap::new();
                if !self.try_read('}') {
                    loop {
                        let key = self.read_integer()?;
                        self.expect(':')?;
                        map.insert(key, self.read_integer()?);
                        if self.try_read('}') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(AttrValue::IntMap(map))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(AttrValue::Int(self.read_integer()?)),
            _ => match self.read_identifier()? {
                "true" => Ok(AttrValue::Bool(true)),
                "false" => Ok(AttrValue::Bool(false)),
                other => Err(self.error(format!("unexpected attribute value '{}'", other))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fused_call() {
        let m = parse_module(
            r#"
; comment
computation %fused {
  %p0 = f32[4] parameter(0)
  ROOT %e = f32[4] exp(%p0)
}
entry computation %main {
  %a = f32[4] parameter(0)
  ROOT %c = f32[4] call(%a), to=%fused, kind=fusion:exp
}
"#,
        )
        .unwrap();
        let main = m.entry().unwrap();
        assert_eq!(m.computation(main).name(), "main");
        let c = m.root(main).unwrap();
        assert_eq!(m.inst(c).fusion_type(), Some("exp"));
        let fused = m.inst(c).called_computation().unwrap();
        assert_eq!(m.inst(m.root(fused).unwrap()).kind(), OpKind::Exp);
        m.verify().unwrap();
    }

    #[test]
    fn test_parse_attributes() {
        let m = parse_module(
            r#"
entry computation %main {
  %a = f32[4] parameter(0)
  %b = f32[4] parameter(1)
  %k = f32[] constant(-1.5)
  %cc = f32[4] custom-call(%a, %b), target="group_norm", attrs={layout_sensitive=true, layout_dependencies={1:0}, allocating_indices=[0], mode="fast", depth=2}, sharding=1, metadata="op_name=gn", control-predecessors={%n}
  %n = f32[4] negate(%a)
  %t = (f32[4], f32[4]) tuple(%cc, %n)
  ROOT %g = f32[4] get-tuple-element(%t), index=1
}
"#,
        )
        .unwrap();
        let cc = m.find_instruction("cc").unwrap();
        let n = m.find_instruction("n").unwrap();
        let call = m.inst(cc).custom_call().unwrap();
        assert_eq!(call.target, "group_norm");
        assert!(call.bool_attr("layout_sensitive"));
        assert_eq!(call.int_map_attr("layout_dependencies").unwrap().get(&1), Some(&0));
        assert_eq!(call.int_list_attr("allocating_indices"), Some(&[0][..]));
        assert_eq!(call.attributes.get("depth"), Some(&AttrValue::Int(2)));
        assert_eq!(m.inst(cc).sharding(), Some(1));
        assert_eq!(m.inst(cc).metadata(), Some("op_name=gn"));
        assert_eq!(m.inst(cc).control_predecessors(), &[n]);
        assert_eq!(m.inst(m.find_instruction("k").unwrap()).literal(), Some("-1.5"));
        assert_eq!(m.inst(m.find_instruction("g").unwrap()).tuple_index(), Some(1));
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = parse_module("entry computation %main {\n  %a = f32[4] parameter(0)\n  ROOT %b = f32[4] negate(%zz)\n}\n")
            .unwrap_err();
        assert_eq!(
            err,
            PassError::Parse {
                line: 3,
                message: "use of undefined value '%zz'".to_string()
            }
        );

        let err = parse_module("computation %c {\n  ROOT %a = f32[4] parameter(0)\n}\n").unwrap_err();
        assert!(matches!(err, PassError::Parse { .. }));

        let err = parse_module("entry computation %main {\n  ROOT %a = f32[4] frobnicate()\n}\n").unwrap_err();
        assert!(err.to_string().contains("unknown opcode 'frobnicate'"));
    }
}
