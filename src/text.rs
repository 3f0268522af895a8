/*
 *  text.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  Reflow arbitrary text into the fixed character grid of the LCD.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

/// Greedy word-wrap of `text` into exactly `rows` lines of at most
/// `cols` characters each.
///
/// Newlines start a new paragraph group on the next unfilled line.
/// A word longer than `cols` at the start of a line is hard-truncated
/// to `cols` characters and the remainder is discarded. Layout stops
/// once `rows` lines exist; short output is padded with empty strings.
pub fn wrap_lines(text: &str, rows: usize, cols: usize) -> Vec<String> {
    let text = strip_non_ascii(text);
    let mut lines: Vec<String> = Vec::with_capacity(rows);

    for group in text.split('\n') {
        if lines.len() >= rows {
            break;
        }
        let words: Vec<&str> = group.split(' ').collect();
        let mut word = 0;

        while lines.len() < rows && word < words.len() {
            let mut line = String::new();
            let mut filled = 0usize; // characters, not bytes

            while word < words.len() {
                let candidate = words[word];
                let len = candidate.chars().count();
                if len == 0 {
                    // runs of spaces: skip without consuming line width
                    word += 1;
                    continue;
                }
                if filled == 0 && len > cols {
                    line.extend(candidate.chars().take(cols));
                    word += 1; // remainder discarded, not carried over
                    break;
                }
                let sep = if filled == 0 { 0 } else { 1 };
                if filled + sep + len <= cols {
                    if sep == 1 {
                        line.push(' ');
                    }
                    line.push_str(candidate);
                    filled += sep + len;
                    word += 1;
                } else {
                    break;
                }
            }
            lines.push(line);
        }
    }

    while lines.len() < rows {
        lines.push(String::new());
    }
    lines
}

/// Drop every character the controller's extended-ASCII charset cannot
/// represent (anything above 0xFF).
fn strip_non_ascii(text: &str) -> String {
    text.chars().filter(|c| (*c as u32) <= 0xFF).collect()
}
