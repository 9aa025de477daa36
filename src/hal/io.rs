//! Binary persistence of tensors.
//!
//! A tensor is written as
//! `[u32 ndim][u32 dims..][i32 device code][i32 device id][i32 type tag][payload]`, all little
//! endian, the payload being the raw elements in row-major order. A none handle is written as a
//! zero rank shape alone. A list is written as
//! `[u64 magic][u64 reserved][u64 count][tensor..][u64 count][u64 len][utf-8 name]..`, where the
//! name count is either zero or the tensor count.

use std::io::{ErrorKind, Read, Write};

use crate::loom::{
    device::{Context, DeviceKind},
    engine::{Engine, PRIORITY_NORMAL},
    num::DataType,
    shape::Shape,
    tensor::{NDArray, TensorError},
};

use super::frontend::copy_from_to;

pub const LIST_MAGIC: u64 = 0x112;

fn invalid(message: impl Into<String>) -> TensorError {
    TensorError::InvalidFormat(message.into())
}

fn read_exact(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), TensorError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => invalid("unexpected end of data"),
        _ => err.into(),
    })
}

fn read_u32(reader: &mut impl Read) -> Result<u32, TensorError> {
    let mut buf = [0; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(reader: &mut impl Read) -> Result<i32, TensorError> {
    let mut buf = [0; 4];
    read_exact(reader, &mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, TensorError> {
    let mut buf = [0; 8];
    read_exact(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads exactly `len` bytes without trusting `len` for the allocation up front.
fn read_bytes(reader: &mut impl Read, len: u64) -> Result<Vec<u8>, TensorError> {
    let mut data = vec![];
    reader.take(len).read_to_end(&mut data)?;
    match data.len() as u64 == len {
        true => Ok(data),
        false => Err(invalid("unexpected end of data")),
    }
}

/// Encodes one tensor. Waits for its pending writer, copying it to the host first if needed.
fn encode(array: &NDArray) -> Result<Vec<u8>, TensorError> {
    let Ok(chunk) = array.chunk() else {
        return Ok(0u32.to_le_bytes().to_vec());
    };
    let shape = array.shape();
    let context = chunk.context();

    let ndim = u32::try_from(shape.ndim()).map_err(|_| invalid("too many dimensions"))?;
    let dims = shape
        .iter()
        .map(|&dim| u32::try_from(dim).map_err(|_| invalid(format!("dimension {dim} too large"))))
        .collect::<Result<Vec<_>, _>>()?;
    let id = i32::try_from(context.id)
        .map_err(|_| invalid(format!("device id {} too large", context.id)))?;

    let host = match context.kind {
        DeviceKind::Cpu => array.clone(),
        DeviceKind::Gpu => array.copy_to(Context::cpu())?,
    };
    host.wait_to_read()?;

    let mut record = vec![];
    record.extend_from_slice(&ndim.to_le_bytes());
    for dim in dims {
        record.extend_from_slice(&dim.to_le_bytes());
    }
    record.extend_from_slice(&context.kind.code().to_le_bytes());
    record.extend_from_slice(&id.to_le_bytes());
    record.extend_from_slice(&chunk.data_type().tag().to_le_bytes());
    host.chunk()?.read_bytes(|data| record.extend_from_slice(data));
    Ok(record)
}

/// Writes one tensor. Nothing is written if the tensor cannot be read.
pub fn save(writer: &mut impl Write, array: &NDArray) -> Result<(), TensorError> {
    let record = encode(array)?;
    writer.write_all(&record)?;
    Ok(())
}

/// Reads one tensor into the process-wide engine.
#[inline]
pub fn load(reader: &mut impl Read) -> Result<NDArray, TensorError> {
    load_in(Engine::get(), reader)
}

/// Reads one tensor. Accelerator tensors are restored on the context they were saved from.
pub fn load_in(engine: &Engine, reader: &mut impl Read) -> Result<NDArray, TensorError> {
    let ndim = read_u32(reader)?;
    if ndim == 0 {
        return Ok(NDArray::none());
    }
    let dims = (0..ndim)
        .map(|_| read_u32(reader).map(|dim| dim as usize))
        .collect::<Result<Vec<_>, _>>()?;
    let shape = Shape::new(dims);

    let code = read_i32(reader)?;
    let kind = DeviceKind::from_code(code).ok_or_else(|| invalid(format!("unknown device {code}")))?;
    let id = read_i32(reader)?;
    let id = u32::try_from(id).map_err(|_| invalid(format!("invalid device id {id}")))?;
    let context = Context { kind, id };

    let tag = read_i32(reader)?;
    let r#type = DataType::from_tag(tag)
        .ok_or_else(|| TensorError::UnsupportedType(format!("unknown type tag {tag}")))?;

    let len = shape
        .checked_size()
        .and_then(|size| size.checked_mul(r#type.size()))
        .ok_or_else(|| invalid(format!("shape {shape} overflows")))?;
    let data = read_bytes(reader, len as u64)?;

    let host = NDArray::empty_in(engine, shape, Context::cpu(), r#type)?;
    host.chunk()?.write_bytes(|output| output.copy_from_slice(&data));
    match context.kind {
        DeviceKind::Cpu => Ok(host),
        DeviceKind::Gpu => {
            let output = NDArray::empty_in(engine, host.shape().clone(), context, r#type)?;
            copy_from_to(&host, &output, PRIORITY_NORMAL)?;
            Ok(output)
        }
    }
}

/// Writes a list of tensors with optional names.
pub fn save_list(
    writer: &mut impl Write,
    arrays: &[NDArray],
    names: &[impl AsRef<str>],
) -> Result<(), TensorError> {
    if !names.is_empty() && names.len() != arrays.len() {
        return Err(TensorError::ArgumentCount {
            name: "save_list".into(),
            kind: "names",
            expected: arrays.len(),
            found: names.len(),
        });
    }

    let records = arrays.iter().map(encode).collect::<Result<Vec<_>, _>>()?;

    writer.write_all(&LIST_MAGIC.to_le_bytes())?;
    writer.write_all(&0u64.to_le_bytes())?;
    writer.write_all(&(arrays.len() as u64).to_le_bytes())?;
    for record in records {
        writer.write_all(&record)?;
    }
    writer.write_all(&(names.len() as u64).to_le_bytes())?;
    for name in names {
        let name = name.as_ref().as_bytes();
        writer.write_all(&(name.len() as u64).to_le_bytes())?;
        writer.write_all(name)?;
    }
    Ok(())
}

/// Reads a list of tensors into the process-wide engine.
#[inline]
pub fn load_list(reader: &mut impl Read) -> Result<(Vec<NDArray>, Vec<String>), TensorError> {
    load_list_in(Engine::get(), reader)
}

/// Reads a list of tensors and their names. The names are empty if none were saved.
pub fn load_list_in(
    engine: &Engine,
    reader: &mut impl Read,
) -> Result<(Vec<NDArray>, Vec<String>), TensorError> {
    let magic = read_u64(reader)?;
    if magic != LIST_MAGIC {
        return Err(invalid(format!("invalid list magic {magic:#x}")));
    }
    let _reserved = read_u64(reader)?;

    let count = read_u64(reader)?;
    let mut arrays = vec![];
    for _ in 0..count {
        arrays.push(load_in(engine, reader)?);
    }

    let count = read_u64(reader)?;
    let mut names = vec![];
    for _ in 0..count {
        let len = read_u64(reader)?;
        let name = read_bytes(reader, len)?;
        let name = String::from_utf8(name).map_err(|err| invalid(err.to_string()))?;
        names.push(name);
    }

    if !names.is_empty() && names.len() != arrays.len() {
        return Err(invalid(format!(
            "{} names for {} tensors",
            names.len(),
            arrays.len()
        )));
    }
    Ok((arrays, names))
}

impl NDArray {
    #[inline]
    pub fn save(&self, writer: &mut impl Write) -> Result<(), TensorError> {
        save(writer, self)
    }

    #[inline]
    pub fn load(reader: &mut impl Read) -> Result<Self, TensorError> {
        load(reader)
    }
}
