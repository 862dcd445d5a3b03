/// Read / write float arrays as raw binary

use std::fs::File;
use std::io::{Write, Read, BufWriter, BufReader};

use ndarray::Array4;

use crate::{BoxErr, ImageBatch};

pub fn write(data: impl Iterator<Item = f32>, path: &std::path::Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut buf = BufWriter::new(file);
    for datum in data {
        buf.write_all(&datum.to_le_bytes())?;
    }
    Ok(())
}

type IORes<T> = std::io::Result<T>;
pub fn read<'a>(path: &std::path::Path) -> IORes<impl Iterator<Item = IORes<f32>> + 'a> {
    let file = File::open(path)?;
    let mut buf = BufReader::new(file);
    let mut buffer = [0; 4];

    Ok(std::iter::from_fn(move || {
        use std::io::ErrorKind::UnexpectedEof;
        match buf.read_exact(&mut buffer) {
            Ok(()) => Some(Ok(f32::from_le_bytes(buffer))),
            Err(e) if e.kind() == UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }))
}

/// Write a batch in standard (C-order) layout.
pub fn write_batch(batch: &ImageBatch, path: &std::path::Path) -> std::io::Result<()> {
    write(batch.iter().copied(), path)
}

/// Read a batch written by `write_batch`; the element count must match.
pub fn read_batch(path: &std::path::Path, shape: (usize, usize, usize, usize)) -> BoxErr<ImageBatch> {
    let data: Vec<f32> = read(path)?.collect::<Result<_, _>>()?;
    Ok(Array4::from_shape_vec(shape, data)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn raw_io_roundtrip() -> std::io::Result<()> {
        use tempfile::tempdir;
        #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

        // Harmless temporary location for output file
        let dir = tempdir()?;
        let file_path = dir.path().join("test.bin");

        // Some test data
        let original_data = vec![1.23, 4.56, 7.89];

        // Write data to file
        write(original_data.iter().copied(), &file_path)?;

        // Read data back from file
        let reloaded_data: Vec<_> = read(&file_path)?
            .collect::<Result<_, _>>()?;

        // Check that roundtrip didn't corrupt the data
        assert_eq!(original_data, reloaded_data);
        Ok(())
    }

    #[test]
    fn batch_roundtrip_preserves_layout() -> crate::BoxErr<()> {
        use tempfile::tempdir;
        let dir = tempdir()?;
        let file_path = dir.path().join("batch.raw");

        let mut batch = ImageBatch::zeros((2, 1, 3, 3));
        batch[(1, 0, 2, 1)] = 7.5;
        batch[(0, 0, 0, 0)] = -1.0;
        write_batch(&batch, &file_path)?;
        let reloaded = read_batch(&file_path, (2, 1, 3, 3))?;
        assert_eq!(batch, reloaded);
        Ok(())
    }
}
