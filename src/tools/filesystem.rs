//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径先做词法归一化（禁止 ../ 逃逸），读路径再 canonicalize 防符号链接逃逸；
//! ReadFileTool / WriteFileTool / ListDirectoryTool 基于 SafeFs 提供 read_file / write_file / list_directory。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
use crate::tools::Tool;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法解析：相对路径拼到根下，绝对路径必须已在根下；`..` 越过根即视为逃逸
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let requested = Path::new(path.trim());
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root_dir)
                .map_err(|_| format!("Path escapes workspace: {}", path))?
                .to_path_buf()
        } else {
            requested.to_path_buf()
        };

        let mut resolved = self.root_dir.clone();
        let mut depth = 0usize;
        for comp in relative.components() {
            match comp {
                Component::Normal(c) => {
                    resolved.push(c);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(format!("Path escapes workspace: {}", path));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("Path escapes workspace: {}", path));
                }
            }
        }
        Ok(resolved)
    }

    /// 解析已存在的路径：额外检查 canonicalize 后仍在根下（符号链接）
    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf, String> {
        let resolved = self.resolve(path)?;
        let canonical = resolved
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {}", path))
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

/// read_file：读取文件，可选 0 起始、闭区间的 line_start / line_end
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "file_path".into(),
            ParamSpec::required(ParamType::String, "Path to the file to read."),
        );
        p.insert(
            "line_start".into(),
            ParamSpec::optional(
                ParamType::Integer,
                "Optional line number to start reading from (0-indexed).",
            ),
        );
        p.insert(
            "line_end".into(),
            ParamSpec::optional(
                ParamType::Integer,
                "Optional line number to end reading at (0-indexed, inclusive).",
            ),
        );
        p
    }

    fn output_description(&self) -> &str {
        "The contents of the file, possibly limited to specified lines."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let file_path = str_arg(&args, "file_path").ok_or("file_path is required")?;
        let path = self.fs.resolve_existing(file_path)?;
        if !path.is_file() {
            return Err(format!("Not a file: {}", file_path));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {}", e))?;

        let line_start = args.get("line_start").and_then(Value::as_i64);
        let line_end = args.get("line_end").and_then(Value::as_i64);
        match (line_start, line_end) {
            (Some(start), Some(end)) => {
                let lines: Vec<&str> = content.split_inclusive('\n').collect();
                if lines.is_empty() {
                    return Ok(String::new());
                }
                let start = start.max(0) as usize;
                let end = (end.max(0) as usize).min(lines.len() - 1);
                let slice = if start <= end {
                    lines[start..=end].concat()
                } else {
                    String::new()
                };
                Ok(format!("Lines {}-{} from {}:\n{}", start, end, file_path, slice))
            }
            _ => Ok(content),
        }
    }
}

/// write_file：写入文件（自动创建父目录），可选 append
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "file_path".into(),
            ParamSpec::required(ParamType::String, "Path to the file to write."),
        );
        p.insert(
            "content".into(),
            ParamSpec::required(ParamType::String, "Content to write to the file."),
        );
        p.insert(
            "append".into(),
            ParamSpec::optional(
                ParamType::Boolean,
                "Whether to append to the file instead of overwriting it.",
            ),
        );
        p
    }

    fn output_description(&self) -> &str {
        "Status message indicating success or failure."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        use tokio::io::AsyncWriteExt;

        let file_path = str_arg(&args, "file_path").ok_or("file_path is required")?;
        let content = str_arg(&args, "content").ok_or("content is required")?;
        let append = args.get("append").and_then(Value::as_bool).unwrap_or(false);

        let path = self.fs.resolve(file_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create directory failed: {}", e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(|e| format!("Open failed: {}", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| format!("Write failed: {}", e))?;
        file.flush().await.map_err(|e| format!("Write failed: {}", e))?;

        Ok(format!(
            "Successfully {} {}",
            if append { "appended to" } else { "wrote" },
            file_path
        ))
    }
}

/// list_directory：列出目录，目录在前（带 /），文件在后，均排序；可选 glob pattern
pub struct ListDirectoryTool {
    fs: SafeFs,
}

impl ListDirectoryTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories in a specified path."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "directory".into(),
            ParamSpec::optional(ParamType::String, "Path to the directory to list."),
        );
        p.insert(
            "pattern".into(),
            ParamSpec::optional(ParamType::String, "Optional glob pattern to filter results."),
        );
        p
    }

    fn output_description(&self) -> &str {
        "List of files and directories in the specified path."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let directory = str_arg(&args, "directory").unwrap_or(".");
        let pattern_str = str_arg(&args, "pattern").unwrap_or("*");
        let pattern = glob::Pattern::new(pattern_str)
            .map_err(|e| format!("Invalid pattern '{}': {}", pattern_str, e))?;

        let path = self.fs.resolve_existing(directory)?;
        if !path.is_dir() {
            return Err(format!("Not a directory: {}", directory));
        }

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| format!("List failed: {}", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("List failed: {}", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !pattern.matches(&name) {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                dirs.push(format!("{}/", name));
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();

        let mut result = format!("Contents of {} (pattern: {}):\n\n", directory, pattern_str);
        if !dirs.is_empty() {
            result.push_str("Directories:\n");
            result.push_str(&dirs.join("\n"));
            result.push_str("\n\n");
        }
        if !files.is_empty() {
            result.push_str("Files:\n");
            result.push_str(&files.join("\n"));
        }
        if dirs.is_empty() && files.is_empty() {
            result.push_str("No items found matching the pattern.");
        }
        Ok(result)
    }
}
