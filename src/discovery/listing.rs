//! Parsing of mirror directory listings

use regex::{Regex, RegexBuilder};

/// One entry of `rsync --list-only` output, path relative to the listed
/// directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsyncEntry {
    pub path: String,
    pub is_dir: bool,
}

/// Compiled listing grammars, built once per discoverer
#[derive(Debug, Clone)]
pub struct ListingParser {
    href: Regex,
    rsync_line: Regex,
}

impl ListingParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            href: RegexBuilder::new(r#"<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#)
                .case_insensitive(true)
                .build()?,
            // perms, size, date, time, name
            rsync_line: Regex::new(r"^([-a-zA-Z]{10})\s+[\d,.]+\s+\S+\s+\S+\s+(.+)$")?,
        })
    }

    /// Link targets of every anchor in an HTML index page, in page order
    pub fn html_links<'a>(&self, body: &'a str) -> Vec<&'a str> {
        self.href
            .captures_iter(body)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .filter(|href| {
                !href.is_empty()
                    && !href.starts_with('#')
                    && !href.starts_with("mailto:")
                    && !href.starts_with("javascript:")
            })
            .collect()
    }

    /// Entries of `rsync --list-only`; the `.` line and unparsable lines are
    /// dropped and symlinks are listed under their own name
    pub fn rsync_entries(&self, output: &str) -> Vec<RsyncEntry> {
        output
            .lines()
            .filter_map(|line| self.rsync_line.captures(line.trim_end()))
            .filter_map(|c| {
                let perms = c.get(1)?.as_str();
                let name = c.get(2)?.as_str();
                let name = name.split_once(" -> ").map_or(name, |(link, _)| link);
                if name == "." {
                    return None;
                }
                Some(RsyncEntry {
                    path: name.to_string(),
                    is_dir: perms.starts_with('d'),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_links_from_autoindex() {
        let page = r##"<html><head><title>Index of /releases/24.04/</title></head>
<body><h1>Index of /releases/24.04/</h1><pre>
<a href="?C=N;O=D">Name</a> <a href="?C=M;O=A">Last modified</a>
<a href="/releases/">Parent Directory</a>
<a href="SHA256SUMS">SHA256SUMS</a>              2024-08-29 15:13   202
<A HREF='ubuntu-24.04.1-desktop-amd64.iso'>ubuntu-24.04.1-desktop-amd64.iso</A>
<a class="file" href="ubuntu-24.04.1-live-server-amd64.iso">ubuntu-24.04.1-live-server-amd64.iso</a>
<a href="#top">top</a>
<a href="netboot/">netboot/</a>
</pre></body></html>"##;

        let parser = ListingParser::new().unwrap();
        assert_eq!(
            parser.html_links(page),
            vec![
                "?C=N;O=D",
                "?C=M;O=A",
                "/releases/",
                "SHA256SUMS",
                "ubuntu-24.04.1-desktop-amd64.iso",
                "ubuntu-24.04.1-live-server-amd64.iso",
                "netboot/",
            ]
        );
    }

    #[test]
    fn test_rsync_list_only_output() {
        let output = "\
drwxr-xr-x          4,096 2024/10/05 09:12:44 .
-rw-r--r--     2,229,141,504 2024/04/16 20:31:02 Fedora-Workstation-Live-x86_64-40-1.14.iso
-rw-r--r--          1,058 2024/04/16 20:31:05 Fedora-Workstation-40-1.14-x86_64-CHECKSUM
lrwxrwxrwx             41 2024/04/16 20:31:06 latest.iso -> Fedora-Workstation-Live-x86_64-40-1.14.iso
drwxr-xr-x          4,096 2024/04/16 20:31:06 images
-rw-r--r--     1,000 2024/04/16 20:31:06 images/boot image.iso

receiving incremental file list
";
        let parser = ListingParser::new().unwrap();
        let entries = parser.rsync_entries(output);
        let paths: Vec<(&str, bool)> = entries.iter().map(|e| (e.path.as_str(), e.is_dir)).collect();
        assert_eq!(
            paths,
            vec![
                ("Fedora-Workstation-Live-x86_64-40-1.14.iso", false),
                ("Fedora-Workstation-40-1.14-x86_64-CHECKSUM", false),
                ("latest.iso", false),
                ("images", true),
                ("images/boot image.iso", false),
            ]
        );
    }
}
