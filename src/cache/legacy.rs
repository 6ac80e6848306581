//! Java object stream reader for legacy sidecars
//!
//! Sidecars written by the Java desktop client are `ObjectOutputStream`
//! dumps of a single record object. This reader covers the part of the
//! stream grammar such a record uses: objects and their class descriptors,
//! strings, enums, arrays, primitives, block data written by custom
//! `writeObject` methods, and back references. Proxy classes and
//! externalizable objects without block data are rejected.

use std::io::{self, Read};
use std::rc::Rc;

const STREAM_MAGIC: u16 = 0xACED;
const STREAM_VERSION: u16 = 5;
const BASE_WIRE_HANDLE: u32 = 0x7E_0000;

const TC_NULL: u8 = 0x70;
const TC_REFERENCE: u8 = 0x71;
const TC_CLASSDESC: u8 = 0x72;
const TC_OBJECT: u8 = 0x73;
const TC_STRING: u8 = 0x74;
const TC_ARRAY: u8 = 0x75;
const TC_CLASS: u8 = 0x76;
const TC_BLOCKDATA: u8 = 0x77;
const TC_ENDBLOCKDATA: u8 = 0x78;
const TC_RESET: u8 = 0x79;
const TC_BLOCKDATALONG: u8 = 0x7A;
const TC_LONGSTRING: u8 = 0x7C;
const TC_PROXYCLASSDESC: u8 = 0x7D;
const TC_ENUM: u8 = 0x7E;

const SC_WRITE_METHOD: u8 = 0x01;
const SC_SERIALIZABLE: u8 = 0x02;
const SC_EXTERNALIZABLE: u8 = 0x04;
const SC_BLOCK_DATA: u8 = 0x08;

/// Nesting limit for objects inside objects
const MAX_DEPTH: usize = 64;

/// Largest string, block or array accepted
const MAX_LENGTH: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum JavaStreamError {
    #[error("not a Java object stream")]
    BadMagic,

    #[error("unsupported stream version {0}")]
    Version(u16),

    #[error("unexpected type code 0x{0:02x}")]
    UnexpectedTag(u8),

    #[error("dangling back reference 0x{0:x}")]
    BadReference(u32),

    #[error("unsupported stream content: {0}")]
    Unsupported(&'static str),

    #[error("truncated stream: {0}")]
    Io(#[from] io::Error),
}

/// A value read from the stream
#[derive(Debug, Clone, PartialEq)]
pub enum JavaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(u16),
    Str(String),
    Enum { class_name: String, constant: String },
    Array(Vec<JavaValue>),
    Object(JavaObject),
    Class(String),
    Block(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JavaObject {
    pub class_name: String,
    /// Field values of every serializable class in the hierarchy, superclass first
    pub fields: Vec<(String, JavaValue)>,
    /// Extra data written by custom `writeObject` methods
    pub annotations: Vec<JavaValue>,
}

impl JavaObject {
    /// Value of a field; subclass fields shadow superclass fields
    pub fn field(&self, name: &str) -> Option<&JavaValue> {
        self.fields
            .iter()
            .rev()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

impl JavaValue {
    /// Textual form of string-like values
    ///
    /// Understands `String`, `java.io.File`, `java.net.URI` and
    /// `java.net.URL`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            JavaValue::Str(s) => Some(s.clone()),
            JavaValue::Object(object) => match object.class_name.as_str() {
                "java.io.File" => object.field("path")?.as_text(),
                "java.net.URI" => object.field("string")?.as_text(),
                "java.net.URL" => {
                    let protocol = object.field("protocol")?.as_text()?;
                    let host = object.field("host")?.as_text().unwrap_or_default();
                    let file = object.field("file")?.as_text().unwrap_or_default();
                    match object.field("port") {
                        Some(JavaValue::Int(port)) if *port >= 0 => {
                            Some(format!("{}://{}:{}{}", protocol, host, port, file))
                        }
                        _ => Some(format!("{}://{}{}", protocol, host, file)),
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Parse a stream holding one top-level value
pub fn read_object(bytes: &[u8]) -> Result<JavaValue, JavaStreamError> {
    let mut reader = StreamReader {
        input: bytes,
        handles: Vec::new(),
        depth: 0,
    };
    if reader.read_u16()? != STREAM_MAGIC {
        return Err(JavaStreamError::BadMagic);
    }
    let version = reader.read_u16()?;
    if version != STREAM_VERSION {
        return Err(JavaStreamError::Version(version));
    }
    reader.read_content()
}

#[derive(Debug)]
struct FieldDesc {
    type_code: u8,
    name: String,
}

#[derive(Debug)]
struct ClassDesc {
    name: String,
    flags: u8,
    fields: Vec<FieldDesc>,
    super_class: Option<Rc<ClassDesc>>,
}

enum Handle {
    Class(Rc<ClassDesc>),
    Value(JavaValue),
    /// Object still being read
    Pending,
}

struct StreamReader<R> {
    input: R,
    handles: Vec<Handle>,
    depth: usize,
}

impl<R: Read> StreamReader<R> {
    fn read_u8(&mut self) -> Result<u8, JavaStreamError> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16, JavaStreamError> {
        let mut buf = [0u8; 2];
        self.input.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, JavaStreamError> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, JavaStreamError> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>, JavaStreamError> {
        if len > MAX_LENGTH {
            return Err(JavaStreamError::Unsupported("length too large"));
        }
        let mut buf = vec![0u8; len as usize];
        self.input.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_utf(&mut self) -> Result<String, JavaStreamError> {
        let len = self.read_u16()?;
        let bytes = self.read_bytes(u64::from(len))?;
        decode_modified_utf8(&bytes)
    }

    fn new_handle(&mut self, handle: Handle) -> usize {
        self.handles.push(handle);
        self.handles.len() - 1
    }

    fn set_handle(&mut self, index: usize, handle: Handle) -> Result<(), JavaStreamError> {
        let slot = self
            .handles
            .get_mut(index)
            .ok_or(JavaStreamError::Unsupported("reset inside an object"))?;
        *slot = handle;
        Ok(())
    }

    fn read_reference(&mut self) -> Result<&Handle, JavaStreamError> {
        let wire = self.read_u32()?;
        wire.checked_sub(BASE_WIRE_HANDLE)
            .and_then(|index| self.handles.get(index as usize))
            .ok_or(JavaStreamError::BadReference(wire))
    }

    fn read_content(&mut self) -> Result<JavaValue, JavaStreamError> {
        let mut tag = self.read_u8()?;
        while tag == TC_RESET {
            self.handles.clear();
            tag = self.read_u8()?;
        }

        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(JavaStreamError::Unsupported("nesting too deep"));
        }
        let value = self.read_tagged(tag);
        self.depth -= 1;
        value
    }

    fn read_tagged(&mut self, tag: u8) -> Result<JavaValue, JavaStreamError> {
        match tag {
            TC_NULL => Ok(JavaValue::Null),
            TC_REFERENCE => match self.read_reference()? {
                Handle::Value(value) => Ok(value.clone()),
                Handle::Class(desc) => Ok(JavaValue::Class(desc.name.clone())),
                Handle::Pending => Err(JavaStreamError::Unsupported("cyclic reference")),
            },
            TC_STRING => {
                let s = self.read_utf()?;
                self.new_handle(Handle::Value(JavaValue::Str(s.clone())));
                Ok(JavaValue::Str(s))
            }
            TC_LONGSTRING => {
                let len = self.read_u64()?;
                let s = decode_modified_utf8(&self.read_bytes(len)?)?;
                self.new_handle(Handle::Value(JavaValue::Str(s.clone())));
                Ok(JavaValue::Str(s))
            }
            TC_OBJECT => self.read_new_object(),
            TC_ARRAY => self.read_new_array(),
            TC_ENUM => self.read_new_enum(),
            TC_CLASS => {
                let desc = self
                    .read_class_desc()?
                    .ok_or(JavaStreamError::Unsupported("class without descriptor"))?;
                let value = JavaValue::Class(desc.name.clone());
                self.new_handle(Handle::Value(value.clone()));
                Ok(value)
            }
            TC_BLOCKDATA => {
                let len = self.read_u8()?;
                Ok(JavaValue::Block(self.read_bytes(u64::from(len))?))
            }
            TC_BLOCKDATALONG => {
                let len = self.read_u32()?;
                Ok(JavaValue::Block(self.read_bytes(u64::from(len))?))
            }
            other => Err(JavaStreamError::UnexpectedTag(other)),
        }
    }

    fn read_class_desc(&mut self) -> Result<Option<Rc<ClassDesc>>, JavaStreamError> {
        match self.read_u8()? {
            TC_NULL => Ok(None),
            TC_REFERENCE => match self.read_reference()? {
                Handle::Class(desc) => Ok(Some(Rc::clone(desc))),
                _ => Err(JavaStreamError::Unsupported("reference is not a class descriptor")),
            },
            TC_CLASSDESC => self.read_new_class_desc().map(Some),
            TC_PROXYCLASSDESC => Err(JavaStreamError::Unsupported("proxy class")),
            other => Err(JavaStreamError::UnexpectedTag(other)),
        }
    }

    fn read_new_class_desc(&mut self) -> Result<Rc<ClassDesc>, JavaStreamError> {
        let name = self.read_utf()?;
        let _serial_version_uid = self.read_u64()?;
        let handle = self.new_handle(Handle::Pending);

        let flags = self.read_u8()?;
        let count = self.read_u16()?;
        let mut fields = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let type_code = self.read_u8()?;
            let field_name = self.read_utf()?;
            match type_code {
                b'L' | b'[' => {
                    // Declared type as a string object; only the value matters
                    self.read_content()?;
                }
                b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => {}
                other => return Err(JavaStreamError::UnexpectedTag(other)),
            }
            fields.push(FieldDesc {
                type_code,
                name: field_name,
            });
        }

        self.read_annotations()?;
        let super_class = self.read_class_desc()?;

        let desc = Rc::new(ClassDesc {
            name,
            flags,
            fields,
            super_class,
        });
        self.set_handle(handle, Handle::Class(Rc::clone(&desc)))?;
        Ok(desc)
    }

    /// Contents up to the closing `TC_ENDBLOCKDATA`
    fn read_annotations(&mut self) -> Result<Vec<JavaValue>, JavaStreamError> {
        let mut values = Vec::new();
        loop {
            let tag = self.read_u8()?;
            if tag == TC_ENDBLOCKDATA {
                return Ok(values);
            }
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                return Err(JavaStreamError::Unsupported("nesting too deep"));
            }
            let value = self.read_tagged(tag);
            self.depth -= 1;
            values.push(value?);
        }
    }

    fn read_new_object(&mut self) -> Result<JavaValue, JavaStreamError> {
        let desc = self
            .read_class_desc()?
            .ok_or(JavaStreamError::Unsupported("object without class"))?;
        let handle = self.new_handle(Handle::Pending);

        let mut hierarchy = Vec::new();
        let mut current = Some(Rc::clone(&desc));
        while let Some(class) = current {
            current = class.super_class.clone();
            hierarchy.push(class);
        }

        let mut fields = Vec::new();
        let mut annotations = Vec::new();
        for class in hierarchy.iter().rev() {
            if class.flags & SC_EXTERNALIZABLE != 0 {
                if class.flags & SC_BLOCK_DATA == 0 {
                    return Err(JavaStreamError::Unsupported("externalizable without block data"));
                }
                annotations.extend(self.read_annotations()?);
                continue;
            }
            if class.flags & SC_SERIALIZABLE == 0 {
                continue;
            }
            for field in &class.fields {
                let value = self.read_field_value(field.type_code)?;
                fields.push((field.name.clone(), value));
            }
            if class.flags & SC_WRITE_METHOD != 0 {
                annotations.extend(self.read_annotations()?);
            }
        }

        let value = JavaValue::Object(JavaObject {
            class_name: desc.name.clone(),
            fields,
            annotations,
        });
        self.set_handle(handle, Handle::Value(value.clone()))?;
        Ok(value)
    }

    fn read_new_array(&mut self) -> Result<JavaValue, JavaStreamError> {
        let desc = self
            .read_class_desc()?
            .ok_or(JavaStreamError::Unsupported("array without class"))?;
        let handle = self.new_handle(Handle::Pending);

        let len = self.read_u32()?;
        if u64::from(len) > MAX_LENGTH {
            return Err(JavaStreamError::Unsupported("length too large"));
        }
        let element_type = desc.name.as_bytes().get(1).copied().unwrap_or(b'L');

        let mut elements = Vec::new();
        for _ in 0..len {
            elements.push(self.read_field_value(element_type)?);
        }

        let value = JavaValue::Array(elements);
        self.set_handle(handle, Handle::Value(value.clone()))?;
        Ok(value)
    }

    fn read_new_enum(&mut self) -> Result<JavaValue, JavaStreamError> {
        let desc = self
            .read_class_desc()?
            .ok_or(JavaStreamError::Unsupported("enum without class"))?;
        let handle = self.new_handle(Handle::Pending);

        let JavaValue::Str(constant) = self.read_content()? else {
            return Err(JavaStreamError::Unsupported("enum constant is not a string"));
        };

        let value = JavaValue::Enum {
            class_name: desc.name.clone(),
            constant,
        };
        self.set_handle(handle, Handle::Value(value.clone()))?;
        Ok(value)
    }

    fn read_field_value(&mut self, type_code: u8) -> Result<JavaValue, JavaStreamError> {
        Ok(match type_code {
            b'B' => JavaValue::Int(i64::from(self.read_u8()? as i8)),
            b'C' => JavaValue::Char(self.read_u16()?),
            b'D' => JavaValue::Float(f64::from_bits(self.read_u64()?)),
            b'F' => JavaValue::Float(f64::from(f32::from_bits(self.read_u32()?))),
            b'I' => JavaValue::Int(i64::from(self.read_u32()? as i32)),
            b'J' => JavaValue::Int(self.read_u64()? as i64),
            b'S' => JavaValue::Int(i64::from(self.read_u16()? as i16)),
            b'Z' => JavaValue::Bool(self.read_u8()? != 0),
            _ => self.read_content()?,
        })
    }
}

/// Decode Java's modified UTF-8 (two-byte NUL, surrogate pairs as two
/// three-byte sequences)
fn decode_modified_utf8(bytes: &[u8]) -> Result<String, JavaStreamError> {
    let malformed = || JavaStreamError::Unsupported("malformed modified UTF-8");
    let continuation = |b: Option<&u8>| -> Result<u16, JavaStreamError> {
        match b {
            Some(b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
            _ => Err(malformed()),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let low = continuation(bytes.get(i + 1))?;
            units.push((u16::from(b & 0x1F) << 6) | low);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let mid = continuation(bytes.get(i + 1))?;
            let low = continuation(bytes.get(i + 2))?;
            units.push((u16::from(b & 0x0F) << 12) | (mid << 6) | low);
            i += 3;
        } else {
            return Err(malformed());
        }
    }

    String::from_utf16(&units).map_err(|_| malformed())
}
