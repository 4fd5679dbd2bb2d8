use std::io::Write;

use super::tree::{DirectoryTree, Node};
use crate::{diag::Result, engine::Session};

const FOLDER_SVG: &str = "<svg class='svg-icon' viewBox='0 0 20 20'><path d='M2 4c0-1.1.9-2 2-2h4l2 2h6c1.1 0 2 .9 2 2v10c0 1.1-.9 2-2 2H4c-1.1 0-2-.9-2-2V4z'/></svg>";
const FILE_SVG: &str = "<svg class='svg-icon' viewBox='0 0 20 20'><path d='M13 2H6C4.9 2 4 2.9 4 4v12c0 1.1.9 2 2 2h8c1.1 0 2-.9 2-2V7l-3-5zM13 8V3.5L17.5 8H13z'/></svg>";

const STYLE: &str = r":root { --spacing: 0.5rem; --primary: #0066cc; --border: #ddd; --text: #333; --bg: #fff; }
@media (prefers-color-scheme: dark) {
  :root { --primary: #4d94ff; --border: #444; --text: #eee; --bg: #222; }
}
* { box-sizing: border-box; margin: 0; padding: 0; }
body { font-family: system-ui, sans-serif; background: var(--bg); color: var(--text); line-height: 1.5; }
.container { padding: var(--spacing); max-width: 1600px; margin: 0 auto; }
h1 { font-size: 1.5rem; margin-bottom: var(--spacing); }
.search { position: sticky; top: 0; background: var(--bg); padding: var(--spacing) 0; z-index: 1; }
#search-box { width: 100%; padding: calc(var(--spacing) * 0.75); font-size: 1rem; border: 2px solid var(--border); border-radius: 4px; background: var(--bg); color: var(--text); }
#search-box:focus { outline: none; border-color: var(--primary); }
.directory-tree { font-family: 'SF Mono', Consolas, monospace; font-size: 0.9rem; }
.tree-node { display: flex; flex-direction: column; margin: calc(var(--spacing) * 0.25) 0; }
.node-content { display: flex; align-items: center; padding: calc(var(--spacing) * 0.5); border-radius: 4px; }
.node-content:hover { background-color: rgba(0, 102, 204, 0.1); }
.svg-icon { width: 16px; height: 16px; fill: currentColor; vertical-align: middle; }
.folder-icon, .file-icon { margin-right: calc(var(--spacing) * 0.5); display: inline-flex; align-items: center; }
.folder-icon { cursor: pointer; transition: transform 0.2s; }
.directory > .node-content { color: var(--primary); font-weight: 600; }
.sequence { color: var(--primary); margin-left: var(--spacing); font-weight: 600; }
.thread-info { margin-left: var(--spacing); opacity: 0.7; }
.children { margin-left: calc(var(--spacing) * 2); border-left: 1px solid var(--border); padding-left: var(--spacing); }
.collapsed > .children { display: none; }
.collapsed > .node-content .folder-icon { transform: rotate(-90deg); }
.hidden { display: none; }
.search-match { background-color: rgba(255, 215, 0, 0.3); border-radius: 2px; }
.summary { margin-top: var(--spacing); padding: var(--spacing); border: 1px solid var(--border); border-radius: 4px; }
";

const SCRIPT: &str = r"function toggleDirectory(element) {
    element.closest('.tree-node').classList.toggle('collapsed');
}

function filterFiles() {
    const text = document.getElementById('search-box').value.toLowerCase();
    const nodes = document.querySelectorAll('.tree-node');
    document.querySelectorAll('.search-match').forEach(el => el.classList.remove('search-match'));
    if (text === '') {
        nodes.forEach(node => node.classList.remove('hidden'));
        return;
    }
    nodes.forEach(node => node.classList.add('hidden'));
    nodes.forEach(node => {
        const content = node.querySelector(':scope > .node-content');
        if (!content.textContent.toLowerCase().includes(text)) {
            return;
        }
        node.classList.remove('hidden', 'collapsed');
        content.querySelector('.name').classList.add('search-match');
        node.querySelectorAll('.tree-node').forEach(child => child.classList.remove('hidden'));
        let parent = node.parentElement.closest('.tree-node');
        while (parent) {
            parent.classList.remove('hidden', 'collapsed');
            parent = parent.parentElement.closest('.tree-node');
        }
    });
}
";

/// Escape `text` for use in HTML element content and quoted attributes.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut ret = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => ret.push_str("&amp;"),
            '<' => ret.push_str("&lt;"),
            '>' => ret.push_str("&gt;"),
            '"' => ret.push_str("&quot;"),
            '\'' => ret.push_str("&#39;"),
            _ => ret.push(c),
        }
    }
    ret
}

fn write_node(out: &mut impl Write, node: &Node, depth: usize) -> Result<()> {
    let indent = " ".repeat(depth * 2);
    let class = if node.is_file() { "file" } else { "directory" };
    writeln!(
        out,
        "{indent}<div class='tree-node {class}' title='{}'>",
        escape(&node.path().to_string_lossy())
    )?;
    writeln!(out, "{indent}  <div class='node-content'>")?;
    if node.is_file() {
        writeln!(out, "{indent}    <span class='file-icon'>{FILE_SVG}</span>")?;
    } else {
        writeln!(
            out,
            "{indent}    <span class='folder-icon' onclick='toggleDirectory(this)'>{FOLDER_SVG}</span>"
        )?;
    }
    writeln!(out, "{indent}    <span class='name'>{}</span>", escape(node.name()))?;
    if let Some(access) = node.access() {
        writeln!(out, "{indent}    <span class='sequence'>[{}]</span>", access.sequence)?;
        writeln!(
            out,
            "{indent}    <span class='thread-info'>(Thread: {} - {})</span>",
            access.thread_id,
            escape(&access.thread_name)
        )?;
    }
    writeln!(out, "{indent}  </div>")?;

    let children = node.children();
    if !children.is_empty() {
        writeln!(out, "{indent}  <div class='children'>")?;
        for child in children {
            write_node(out, child, depth + 2)?;
        }
        writeln!(out, "{indent}  </div>")?;
    }

    writeln!(out, "{indent}</div>")?;
    Ok(())
}

/// Write a self-contained HTML page showing the accessed files of `session`
/// as a collapsible, searchable directory tree.
///
/// # Arguments
///
/// * `session` - The finished tracing session.
/// * `title` - Page title, usually the traced command line.
/// * `out` - Destination.
///
/// # Errors
///
/// Returns `Err` if writing to `out` fails.
pub fn render(session: &Session, title: &str, out: &mut impl Write) -> Result<()> {
    let tree = DirectoryTree::from_log(session.log());
    let title = escape(title);

    writeln!(out, "<!DOCTYPE html>")?;
    writeln!(out, "<html>")?;
    writeln!(out, "<head>")?;
    writeln!(out, "<meta charset='utf-8'>")?;
    writeln!(out, "<title>File Access Visualization - {title}</title>")?;
    writeln!(out, "<style>\n{STYLE}</style>")?;
    writeln!(out, "<script>\n{SCRIPT}</script>")?;
    writeln!(out, "</head>")?;
    writeln!(out, "<body>")?;
    writeln!(out, "<div class='container'>")?;
    writeln!(out, "<h1>File Access Visualization</h1>")?;
    writeln!(out, "<p class='command'><code>{title}</code></p>")?;
    writeln!(out, "<div class='search'>")?;
    writeln!(
        out,
        "<input type='text' id='search-box' placeholder='Search files and processes...' oninput='filterFiles()'>"
    )?;
    writeln!(out, "</div>")?;
    writeln!(out, "<div class='directory-tree'>")?;
    write_node(out, tree.root(), 0)?;
    writeln!(out, "</div>")?;

    writeln!(out, "<div class='summary'>")?;
    writeln!(
        out,
        "<p>{} file operations on {} files by {} processes and threads.</p>",
        session.log().len(),
        tree.file_count(),
        session.registry().len()
    )?;
    match session.root_status() {
        Some(code) => writeln!(out, "<p>Exit status: {code}</p>")?,
        None => writeln!(out, "<p>Exit status: unknown</p>")?,
    }
    if let Some(fatal) = session.fatal() {
        writeln!(out, "<p class='fatal'>Tracing aborted: {}</p>", escape(fatal))?;
    }
    writeln!(out, "</div>")?;

    writeln!(out, "</div>")?;
    writeln!(out, "</body>")?;
    writeln!(out, "</html>")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::report::tests::session_with;

    #[test]
    fn test_escape() {
        assert_eq!(
            escape("<a href=\"x\">&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn test_render_shows_badges() {
        let session = session_with(&[(100, "/tmp/project/a.txt"), (101, "/tmp/project/b.txt")]);
        let mut out = Vec::new();
        render(&session, "sh -c 'cat a.txt b.txt'", &mut out).expect("render");
        let html = String::from_utf8(out).expect("utf-8");

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<span class='name'>project</span>"));
        assert!(html.contains("<span class='sequence'>[1]</span>"));
        assert!(html.contains("<span class='sequence'>[2]</span>"));
        assert!(html.contains("(Thread: 100 - sh)"));
        assert!(html.contains("(Thread: 101 - cat)"));
        assert!(html.contains("sh -c &#39;cat a.txt b.txt&#39;"));
        assert!(html.contains("2 file operations on 2 files"));
        assert!(html.contains("id='search-box'"));
        assert!(html.trim_end().ends_with("</html>"));
    }

    #[test]
    fn test_render_escapes_names() {
        let session = session_with(&[(100, "/tmp/<script>.txt")]);
        let mut out = Vec::new();
        render(&session, "x", &mut out).expect("render");
        let html = String::from_utf8(out).expect("utf-8");

        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(!html.contains("<script>.txt"));
    }
}
