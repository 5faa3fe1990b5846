// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Maps RFB pointer/key events to [`InputSink`] calls: edge-detects button
//! and wheel transitions, deduplicates redundant moves, and scales/clamps
//! coordinates before handing them to whatever injects input on the host.
//!
//! `InputSink` is the collaborator boundary — this crate translates, an
//! embedder implements the actual injection (uinput, a virtual HID, a
//! platform automation API, whatever fits their host).

use log::debug;

/// A mouse button, derived from the RFB pointer event's button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    /// Bit 0.
    Left,
    /// Bit 1.
    Middle,
    /// Bit 2.
    Right,
}

/// Scroll wheel direction, derived from the RFB pointer event's button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    /// Bit 3.
    Up,
    /// Bit 4.
    Down,
}

/// A translated key, either a printable character or one from the common
/// non-printable set (arrows, modifiers, F-keys, navigation, numpad).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// A printable ASCII character.
    Char(char),
    /// Backspace.
    Backspace,
    /// Tab.
    Tab,
    /// Return / Enter.
    Return,
    /// Escape.
    Escape,
    /// Delete.
    Delete,
    /// Arrow key.
    ArrowLeft,
    /// Arrow key.
    ArrowUp,
    /// Arrow key.
    ArrowRight,
    /// Arrow key.
    ArrowDown,
    /// Home.
    Home,
    /// End.
    End,
    /// Page Up.
    PageUp,
    /// Page Down.
    PageDown,
    /// Insert.
    Insert,
    /// Shift (left or right; RFB doesn't distinguish in the common keysym).
    Shift,
    /// Control.
    Control,
    /// Alt.
    Alt,
    /// Meta / Super / Windows key.
    Meta,
    /// Caps Lock.
    CapsLock,
    /// Function key F1-F12.
    Function(u8),
    /// Numeric keypad digit 0-9.
    NumpadDigit(u8),
}

/// Injection boundary for translated input. An embedder implements this to
/// drive whatever actually types keys or moves the pointer on the host;
/// this crate never talks to an input device directly.
pub trait InputSink {
    /// Moves the pointer to `(x, y)` in screen coordinates.
    fn move_to(&mut self, x: u16, y: u16);
    /// Presses or releases a mouse button.
    fn button(&mut self, button: MouseButton, down: bool);
    /// Generates a single scroll tick in `direction`.
    fn scroll(&mut self, direction: ScrollDirection);
    /// Presses or releases `key`.
    fn key(&mut self, key: Key, down: bool);
}

const BIT_LEFT: u8 = 1 << 0;
const BIT_MIDDLE: u8 = 1 << 1;
const BIT_RIGHT: u8 = 1 << 2;
const BIT_WHEEL_UP: u8 = 1 << 3;
const BIT_WHEEL_DOWN: u8 = 1 << 4;

/// Stateful translator for one client's pointer/key stream.
pub struct InputTranslator {
    scale_factor: f32,
    screen_width: u16,
    screen_height: u16,
    edge_margin: u16,
    last_button_mask: u8,
    last_position: Option<(u16, u16)>,
}

impl InputTranslator {
    /// Creates a translator for a `screen_width`×`screen_height` screen,
    /// scaling incoming coordinates by `scale_factor` and keeping them
    /// `edge_margin` pixels clear of the screen boundary.
    #[must_use]
    pub fn new(screen_width: u16, screen_height: u16, scale_factor: f32) -> Self {
        Self {
            scale_factor,
            screen_width,
            screen_height,
            edge_margin: 1,
            last_button_mask: 0,
            last_position: None,
        }
    }

    /// Updates the screen dimensions used for coordinate clamping, e.g.
    /// after a desktop resize.
    pub fn set_screen_size(&mut self, width: u16, height: u16) {
        self.screen_width = width;
        self.screen_height = height;
    }

    fn scale_and_clamp(&self, x: u16, y: u16) -> (u16, u16) {
        let sx = (f32::from(x) * self.scale_factor).round() as i32;
        let sy = (f32::from(y) * self.scale_factor).round() as i32;
        let max_x = i32::from(self.screen_width.saturating_sub(self.edge_margin + 1));
        let max_y = i32::from(self.screen_height.saturating_sub(self.edge_margin + 1));
        let cx = sx.clamp(i32::from(self.edge_margin), max_x.max(i32::from(self.edge_margin)));
        let cy = sy.clamp(i32::from(self.edge_margin), max_y.max(i32::from(self.edge_margin)));
        (cx as u16, cy as u16)
    }

    /// Translates one `PointerEvent`, forwarding moves/button edges/wheel
    /// ticks to `sink`. Consecutive events at an identical `(x, y)` never
    /// produce a second `move_to` call.
    pub fn handle_pointer_event(&mut self, sink: &mut impl InputSink, button_mask: u8, x: u16, y: u16) {
        let (cx, cy) = self.scale_and_clamp(x, y);

        if self.last_position != Some((cx, cy)) {
            sink.move_to(cx, cy);
            self.last_position = Some((cx, cy));
        }

        let prior = self.last_button_mask;
        for (bit, button) in [(BIT_LEFT, MouseButton::Left), (BIT_MIDDLE, MouseButton::Middle), (BIT_RIGHT, MouseButton::Right)] {
            let was_down = prior & bit != 0;
            let is_down = button_mask & bit != 0;
            if was_down != is_down {
                sink.button(button, is_down);
            }
        }

        for (bit, direction) in [(BIT_WHEEL_UP, ScrollDirection::Up), (BIT_WHEEL_DOWN, ScrollDirection::Down)] {
            let rising_edge = prior & bit == 0 && button_mask & bit != 0;
            if rising_edge {
                sink.scroll(direction);
            }
        }

        self.last_button_mask = button_mask;
    }

    /// Translates one `KeyEvent`, forwarding to `sink` unless the keysym
    /// isn't in the supported set, in which case it's dropped with a
    /// debug log rather than treated as an error.
    pub fn handle_key_event(&mut self, sink: &mut impl InputSink, down: bool, keysym: u32) {
        match keysym_to_key(keysym) {
            Some(key) => sink.key(key, down),
            None => debug!("dropping unrecognized keysym 0x{keysym:08x}"),
        }
    }
}

/// Maps an X11 keysym to a [`Key`]. Printable ASCII (0x20-0x7e) maps
/// directly to its character; a fixed table covers the common
/// non-printable set. Anything else returns `None`.
fn keysym_to_key(keysym: u32) -> Option<Key> {
    if (0x20..=0x7e).contains(&keysym) {
        return char::from_u32(keysym).map(Key::Char);
    }

    Some(match keysym {
        0xff08 => Key::Backspace,
        0xff09 => Key::Tab,
        0xff0d => Key::Return,
        0xff1b => Key::Escape,
        0xffff => Key::Delete,
        0xff50 => Key::Home,
        0xff57 => Key::End,
        0xff55 => Key::PageUp,
        0xff56 => Key::PageDown,
        0xff63 => Key::Insert,
        0xff51 => Key::ArrowLeft,
        0xff52 => Key::ArrowUp,
        0xff53 => Key::ArrowRight,
        0xff54 => Key::ArrowDown,
        0xffe1 | 0xffe2 => Key::Shift,
        0xffe3 | 0xffe4 => Key::Control,
        0xffe9 | 0xffea => Key::Alt,
        0xffe7 | 0xffe8 | 0xffeb | 0xffec => Key::Meta,
        0xffe5 => Key::CapsLock,
        0xffbe..=0xffc9 => Key::Function((keysym - 0xffbe + 1) as u8), // F1-F12
        0xffb0..=0xffb9 => Key::NumpadDigit((keysym - 0xffb0) as u8),  // KP_0-KP_9
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        moves: Vec<(u16, u16)>,
        buttons: Vec<(MouseButton, bool)>,
        scrolls: Vec<ScrollDirection>,
        keys: Vec<(Key, bool)>,
    }

    impl InputSink for RecordingSink {
        fn move_to(&mut self, x: u16, y: u16) {
            self.moves.push((x, y));
        }
        fn button(&mut self, button: MouseButton, down: bool) {
            self.buttons.push((button, down));
        }
        fn scroll(&mut self, direction: ScrollDirection) {
            self.scrolls.push(direction);
        }
        fn key(&mut self, key: Key, down: bool) {
            self.keys.push((key, down));
        }
    }

    #[test]
    fn duplicate_moves_are_deduplicated() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_pointer_event(&mut sink, 0, 100, 100);
        translator.handle_pointer_event(&mut sink, 0, 100, 100);
        translator.handle_pointer_event(&mut sink, 0, 101, 100);
        assert_eq!(sink.moves, vec![(100, 100), (101, 100)]);
    }

    #[test]
    fn button_edges_emit_down_then_up() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_pointer_event(&mut sink, BIT_LEFT, 10, 10);
        translator.handle_pointer_event(&mut sink, 0, 10, 10);
        assert_eq!(sink.buttons, vec![(MouseButton::Left, true), (MouseButton::Left, false)]);
    }

    #[test]
    fn wheel_rising_edge_emits_single_tick() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_pointer_event(&mut sink, BIT_WHEEL_UP, 10, 10);
        translator.handle_pointer_event(&mut sink, BIT_WHEEL_UP, 10, 10); // held, no repeat
        translator.handle_pointer_event(&mut sink, 0, 10, 10);
        assert_eq!(sink.scrolls, vec![ScrollDirection::Up]);
    }

    #[test]
    fn coordinates_are_scaled_and_clamped() {
        let mut translator = InputTranslator::new(100, 100, 0.5);
        let mut sink = RecordingSink::default();
        translator.handle_pointer_event(&mut sink, 0, 400, 400);
        assert_eq!(sink.moves[0], (98, 98)); // 400*0.5=200, clamped to screen-edge_margin
    }

    #[test]
    fn printable_ascii_maps_to_char() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_key_event(&mut sink, true, 'a' as u32);
        assert_eq!(sink.keys, vec![(Key::Char('a'), true)]);
    }

    #[test]
    fn arrow_keysym_maps_correctly() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_key_event(&mut sink, true, 0xff51);
        assert_eq!(sink.keys, vec![(Key::ArrowLeft, true)]);
    }

    #[test]
    fn unknown_keysym_is_dropped_not_fatal() {
        let mut translator = InputTranslator::new(1920, 1080, 1.0);
        let mut sink = RecordingSink::default();
        translator.handle_key_event(&mut sink, true, 0x1234_5678);
        assert!(sink.keys.is_empty());
    }
}
