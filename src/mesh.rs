//! Wavefront OBJ export of recovered meshes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub fn write_obj<W: Write>(mut writer: W, vertices: &[[f32; 3]], faces: &[[u32; 3]]) -> Result<()> {
    for v in vertices {
        writeln!(writer, "v {} {} {}", v[0], v[1], v[2])?;
    }
    // OBJ は 1 始まり
    for f in faces {
        writeln!(writer, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_obj<P: AsRef<Path>>(path: P, vertices: &[[f32; 3]], faces: &[[u32; 3]]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_obj(BufWriter::new(file), vertices, faces)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// `<output_dir>/<image stem>_<subject>.obj`
pub fn mesh_path(output_dir: &Path, img_path: &Path, subject: usize) -> PathBuf {
    let stem = img_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mesh".to_string());
    output_dir.join(format!("{}_{}.obj", stem, subject))
}

/// Triangles from the `f` lines of an OBJ template, 0-based.
pub fn read_faces<R: BufRead>(reader: R) -> Result<Vec<[u32; 3]>> {
    let mut faces = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("f") {
            continue;
        }
        let indices = tokens
            .map(|t| {
                // "12/4/7" 形式は頂点番号のみ使う
                let index: u32 = t
                    .split('/')
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .with_context(|| format!("line {}: bad face index {:?}", line_no + 1, t))?;
                if index == 0 {
                    bail!("line {}: face indices are 1-based", line_no + 1);
                }
                Ok(index - 1)
            })
            .collect::<Result<Vec<u32>>>()?;
        if indices.len() != 3 {
            bail!("line {}: expected a triangle, got {} indices", line_no + 1, indices.len());
        }
        faces.push([indices[0], indices[1], indices[2]]);
    }
    Ok(faces)
}

pub fn load_faces<P: AsRef<Path>>(path: P) -> Result<Vec<[u32; 3]>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_faces(BufReader::new(file)).with_context(|| format!("failed to parse {}", path.display()))
}
