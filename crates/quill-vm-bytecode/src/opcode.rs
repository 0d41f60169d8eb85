//! Opcode table
//!
//! Every opcode is a variant of one closed enum. The decoder resolves
//! `(operand count, number, version)` once, so execution and compilation
//! dispatch with an exhaustive `match` instead of a runtime table.

use serde::{Deserialize, Serialize};

/// Operand-count class of an opcode, fixed by the instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpcodeKind {
    /// No operands (short form, type 3)
    Op0,
    /// One operand (short form)
    Op1,
    /// Two operands (long form, or variable form with bit 5 clear)
    Op2,
    /// Variable operand count (variable form with bit 5 set)
    Var,
    /// Extended opcode (`0xbe` prefix, v5+)
    Ext,
}

impl std::fmt::Display for OpcodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Op0 => "0OP",
            Self::Op1 => "1OP",
            Self::Op2 => "2OP",
            Self::Var => "VAR",
            Self::Ext => "EXT",
        })
    }
}

/// Resolved opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // ==================== 2OP ====================
    /// `je a b c d ?(label)`
    Je,
    /// `jl a b ?(label)`
    Jl,
    /// `jg a b ?(label)`
    Jg,
    /// `dec_chk (variable) value ?(label)`
    DecChk,
    /// `inc_chk (variable) value ?(label)`
    IncChk,
    /// `jin obj1 obj2 ?(label)`
    Jin,
    /// `test bitmap flags ?(label)`
    Test,
    /// `or a b -> (result)`
    Or,
    /// `and a b -> (result)`
    And,
    /// `test_attr object attribute ?(label)`
    TestAttr,
    /// `set_attr object attribute`
    SetAttr,
    /// `clear_attr object attribute`
    ClearAttr,
    /// `store (variable) value`
    Store,
    /// `insert_obj object destination`
    InsertObj,
    /// `loadw array word-index -> (result)`
    Loadw,
    /// `loadb array byte-index -> (result)`
    Loadb,
    /// `get_prop object property -> (result)`
    GetProp,
    /// `get_prop_addr object property -> (result)`
    GetPropAddr,
    /// `get_next_prop object property -> (result)`
    GetNextProp,
    /// `add a b -> (result)`
    Add,
    /// `sub a b -> (result)`
    Sub,
    /// `mul a b -> (result)`
    Mul,
    /// `div a b -> (result)`
    Div,
    /// `mod a b -> (result)`
    Mod,
    /// `call_2s routine arg1 -> (result)`
    Call2S,
    /// `call_2n routine arg1`
    Call2N,
    /// `set_colour foreground background`
    SetColour,
    /// `throw value stack-frame`
    Throw,

    // ==================== 1OP ====================
    /// `jz a ?(label)`
    Jz,
    /// `get_sibling object -> (result) ?(label)`
    GetSibling,
    /// `get_child object -> (result) ?(label)`
    GetChild,
    /// `get_parent object -> (result)`
    GetParent,
    /// `get_prop_len property-address -> (result)`
    GetPropLen,
    /// `inc (variable)`
    Inc,
    /// `dec (variable)`
    Dec,
    /// `print_addr byte-address-of-string`
    PrintAddr,
    /// `call_1s routine -> (result)`
    Call1S,
    /// `remove_obj object`
    RemoveObj,
    /// `print_obj object`
    PrintObj,
    /// `ret value`
    Ret,
    /// `jump ?(label)`
    Jump,
    /// `print_paddr packed-address-of-string`
    PrintPaddr,
    /// `load (variable) -> (result)`
    Load,
    /// `not value -> (result)` (1OP before v5, VAR from v5)
    Not,
    /// `call_1n routine`
    Call1N,

    // ==================== 0OP ====================
    /// `rtrue`
    Rtrue,
    /// `rfalse`
    Rfalse,
    /// `print (literal-string)`
    Print,
    /// `print_ret (literal-string)`
    PrintRet,
    /// `nop`
    Nop,
    /// `save ?(label)` (v1-3) / `save -> (result)` (v4)
    Save,
    /// `restore ?(label)` (v1-3) / `restore -> (result)` (v4)
    Restore,
    /// `restart`
    Restart,
    /// `ret_popped`
    RetPopped,
    /// `pop` (v1-4)
    Pop,
    /// `catch -> (result)` (v5+)
    Catch,
    /// `quit`
    Quit,
    /// `new_line`
    NewLine,
    /// `show_status`
    ShowStatus,
    /// `verify ?(label)`
    Verify,
    /// `piracy ?(label)`
    Piracy,

    // ==================== VAR ====================
    /// `call_vs routine ...up to 3 args -> (result)` (`call` before v4)
    CallVS,
    /// `storew array word-index value`
    Storew,
    /// `storeb array byte-index value`
    Storeb,
    /// `put_prop object property value`
    PutProp,
    /// `sread text parse` (v1-4)
    Sread,
    /// `aread text parse time routine -> (result)` (v5+)
    Aread,
    /// `print_char output-character-code`
    PrintChar,
    /// `print_num value`
    PrintNum,
    /// `random range -> (result)`
    Random,
    /// `push value`
    Push,
    /// `pull (variable)` (`pull stack -> (result)` in v6)
    Pull,
    /// `split_window lines`
    SplitWindow,
    /// `set_window window`
    SetWindow,
    /// `call_vs2 routine ...up to 7 args -> (result)`
    CallVS2,
    /// `erase_window window`
    EraseWindow,
    /// `erase_line value`
    EraseLine,
    /// `set_cursor line column`
    SetCursor,
    /// `get_cursor array`
    GetCursor,
    /// `set_text_style style`
    SetTextStyle,
    /// `buffer_mode flag`
    BufferMode,
    /// `output_stream number table`
    OutputStream,
    /// `input_stream number`
    InputStream,
    /// `sound_effect number effect volume routine`
    SoundEffect,
    /// `read_char 1 time routine -> (result)`
    ReadChar,
    /// `scan_table x table len form -> (result) ?(label)`
    ScanTable,
    /// `call_vn routine ...up to 3 args`
    CallVN,
    /// `call_vn2 routine ...up to 7 args`
    CallVN2,
    /// `tokenise text parse dictionary flag`
    Tokenise,
    /// `encode_text zscii-text length from coded-text`
    EncodeText,
    /// `copy_table first second size`
    CopyTable,
    /// `print_table zscii-text width height skip`
    PrintTable,
    /// `check_arg_count argument-number ?(label)`
    CheckArgCount,

    // ==================== EXT ====================
    /// `save table bytes name prompt -> (result)`
    SaveExt,
    /// `restore table bytes name prompt -> (result)`
    RestoreExt,
    /// `log_shift number places -> (result)`
    LogShift,
    /// `art_shift number places -> (result)`
    ArtShift,
    /// `set_font font -> (result)`
    SetFont,
    /// `draw_picture picture-number y x`
    DrawPicture,
    /// `picture_data picture-number array ?(label)`
    PictureData,
    /// `erase_picture picture-number y x`
    ErasePicture,
    /// `set_margins left right window`
    SetMargins,
    /// `save_undo -> (result)`
    SaveUndo,
    /// `restore_undo -> (result)`
    RestoreUndo,
    /// `print_unicode char-number`
    PrintUnicode,
    /// `check_unicode char-number -> (result)`
    CheckUnicode,
    /// `set_true_colour foreground background`
    SetTrueColour,

    /// Number with no meaning in this version
    Unknown(OpcodeKind, u8),
}

impl Opcode {
    /// Resolve an opcode number within its kind for a story version.
    pub const fn lookup(kind: OpcodeKind, number: u8, version: u8) -> Self {
        use Opcode::*;
        match kind {
            OpcodeKind::Op2 => match number {
                1 => Je,
                2 => Jl,
                3 => Jg,
                4 => DecChk,
                5 => IncChk,
                6 => Jin,
                7 => Test,
                8 => Or,
                9 => And,
                10 => TestAttr,
                11 => SetAttr,
                12 => ClearAttr,
                13 => Store,
                14 => InsertObj,
                15 => Loadw,
                16 => Loadb,
                17 => GetProp,
                18 => GetPropAddr,
                19 => GetNextProp,
                20 => Add,
                21 => Sub,
                22 => Mul,
                23 => Div,
                24 => Mod,
                25 if version >= 4 => Call2S,
                26 if version >= 5 => Call2N,
                27 if version >= 5 => SetColour,
                28 if version >= 5 => Throw,
                _ => Unknown(kind, number),
            },
            OpcodeKind::Op1 => match number {
                0 => Jz,
                1 => GetSibling,
                2 => GetChild,
                3 => GetParent,
                4 => GetPropLen,
                5 => Inc,
                6 => Dec,
                7 => PrintAddr,
                8 if version >= 4 => Call1S,
                9 => RemoveObj,
                10 => PrintObj,
                11 => Ret,
                12 => Jump,
                13 => PrintPaddr,
                14 => Load,
                15 if version <= 4 => Not,
                15 => Call1N,
                _ => Unknown(kind, number),
            },
            OpcodeKind::Op0 => match number {
                0 => Rtrue,
                1 => Rfalse,
                2 => Print,
                3 => PrintRet,
                4 => Nop,
                5 if version <= 4 => Save,
                6 if version <= 4 => Restore,
                7 => Restart,
                8 => RetPopped,
                9 if version <= 4 => Pop,
                9 => Catch,
                10 => Quit,
                11 => NewLine,
                12 => ShowStatus,
                13 if version >= 3 => Verify,
                15 if version >= 5 => Piracy,
                _ => Unknown(kind, number),
            },
            OpcodeKind::Var => match number {
                0 => CallVS,
                1 => Storew,
                2 => Storeb,
                3 => PutProp,
                4 if version <= 4 => Sread,
                4 => Aread,
                5 => PrintChar,
                6 => PrintNum,
                7 => Random,
                8 => Push,
                9 => Pull,
                10 => SplitWindow,
                11 => SetWindow,
                12 if version >= 4 => CallVS2,
                13 => EraseWindow,
                14 => EraseLine,
                15 => SetCursor,
                16 => GetCursor,
                17 => SetTextStyle,
                18 => BufferMode,
                19 => OutputStream,
                20 => InputStream,
                21 => SoundEffect,
                22 => ReadChar,
                23 => ScanTable,
                24 if version >= 5 => Not,
                25 if version >= 5 => CallVN,
                26 if version >= 5 => CallVN2,
                27 if version >= 5 => Tokenise,
                28 if version >= 5 => EncodeText,
                29 if version >= 5 => CopyTable,
                30 if version >= 5 => PrintTable,
                31 if version >= 5 => CheckArgCount,
                _ => Unknown(kind, number),
            },
            OpcodeKind::Ext => match number {
                0 => SaveExt,
                1 => RestoreExt,
                2 => LogShift,
                3 => ArtShift,
                4 => SetFont,
                5 => DrawPicture,
                6 => PictureData,
                7 => ErasePicture,
                8 => SetMargins,
                9 => SaveUndo,
                10 => RestoreUndo,
                11 => PrintUnicode,
                12 => CheckUnicode,
                13 => SetTrueColour,
                _ => Unknown(kind, number),
            },
        }
    }

    /// Kind and number this opcode is encoded with in `version`.
    ///
    /// Returns `None` when the opcode does not exist in that version.
    pub fn encoding(self, version: u8) -> Option<(OpcodeKind, u8)> {
        use Opcode::*;
        let (kind, number) = match self {
            Je => (OpcodeKind::Op2, 1),
            Jl => (OpcodeKind::Op2, 2),
            Jg => (OpcodeKind::Op2, 3),
            DecChk => (OpcodeKind::Op2, 4),
            IncChk => (OpcodeKind::Op2, 5),
            Jin => (OpcodeKind::Op2, 6),
            Test => (OpcodeKind::Op2, 7),
            Or => (OpcodeKind::Op2, 8),
            And => (OpcodeKind::Op2, 9),
            TestAttr => (OpcodeKind::Op2, 10),
            SetAttr => (OpcodeKind::Op2, 11),
            ClearAttr => (OpcodeKind::Op2, 12),
            Store => (OpcodeKind::Op2, 13),
            InsertObj => (OpcodeKind::Op2, 14),
            Loadw => (OpcodeKind::Op2, 15),
            Loadb => (OpcodeKind::Op2, 16),
            GetProp => (OpcodeKind::Op2, 17),
            GetPropAddr => (OpcodeKind::Op2, 18),
            GetNextProp => (OpcodeKind::Op2, 19),
            Add => (OpcodeKind::Op2, 20),
            Sub => (OpcodeKind::Op2, 21),
            Mul => (OpcodeKind::Op2, 22),
            Div => (OpcodeKind::Op2, 23),
            Mod => (OpcodeKind::Op2, 24),
            Call2S => (OpcodeKind::Op2, 25),
            Call2N => (OpcodeKind::Op2, 26),
            SetColour => (OpcodeKind::Op2, 27),
            Throw => (OpcodeKind::Op2, 28),
            Jz => (OpcodeKind::Op1, 0),
            GetSibling => (OpcodeKind::Op1, 1),
            GetChild => (OpcodeKind::Op1, 2),
            GetParent => (OpcodeKind::Op1, 3),
            GetPropLen => (OpcodeKind::Op1, 4),
            Inc => (OpcodeKind::Op1, 5),
            Dec => (OpcodeKind::Op1, 6),
            PrintAddr => (OpcodeKind::Op1, 7),
            Call1S => (OpcodeKind::Op1, 8),
            RemoveObj => (OpcodeKind::Op1, 9),
            PrintObj => (OpcodeKind::Op1, 10),
            Ret => (OpcodeKind::Op1, 11),
            Jump => (OpcodeKind::Op1, 12),
            PrintPaddr => (OpcodeKind::Op1, 13),
            Load => (OpcodeKind::Op1, 14),
            Not if version <= 4 => (OpcodeKind::Op1, 15),
            Not => (OpcodeKind::Var, 24),
            Call1N => (OpcodeKind::Op1, 15),
            Rtrue => (OpcodeKind::Op0, 0),
            Rfalse => (OpcodeKind::Op0, 1),
            Print => (OpcodeKind::Op0, 2),
            PrintRet => (OpcodeKind::Op0, 3),
            Nop => (OpcodeKind::Op0, 4),
            Save => (OpcodeKind::Op0, 5),
            Restore => (OpcodeKind::Op0, 6),
            Restart => (OpcodeKind::Op0, 7),
            RetPopped => (OpcodeKind::Op0, 8),
            Pop | Catch => (OpcodeKind::Op0, 9),
            Quit => (OpcodeKind::Op0, 10),
            NewLine => (OpcodeKind::Op0, 11),
            ShowStatus => (OpcodeKind::Op0, 12),
            Verify => (OpcodeKind::Op0, 13),
            Piracy => (OpcodeKind::Op0, 15),
            CallVS => (OpcodeKind::Var, 0),
            Storew => (OpcodeKind::Var, 1),
            Storeb => (OpcodeKind::Var, 2),
            PutProp => (OpcodeKind::Var, 3),
            Sread | Aread => (OpcodeKind::Var, 4),
            PrintChar => (OpcodeKind::Var, 5),
            PrintNum => (OpcodeKind::Var, 6),
            Random => (OpcodeKind::Var, 7),
            Push => (OpcodeKind::Var, 8),
            Pull => (OpcodeKind::Var, 9),
            SplitWindow => (OpcodeKind::Var, 10),
            SetWindow => (OpcodeKind::Var, 11),
            CallVS2 => (OpcodeKind::Var, 12),
            EraseWindow => (OpcodeKind::Var, 13),
            EraseLine => (OpcodeKind::Var, 14),
            SetCursor => (OpcodeKind::Var, 15),
            GetCursor => (OpcodeKind::Var, 16),
            SetTextStyle => (OpcodeKind::Var, 17),
            BufferMode => (OpcodeKind::Var, 18),
            OutputStream => (OpcodeKind::Var, 19),
            InputStream => (OpcodeKind::Var, 20),
            SoundEffect => (OpcodeKind::Var, 21),
            ReadChar => (OpcodeKind::Var, 22),
            ScanTable => (OpcodeKind::Var, 23),
            CallVN => (OpcodeKind::Var, 25),
            CallVN2 => (OpcodeKind::Var, 26),
            Tokenise => (OpcodeKind::Var, 27),
            EncodeText => (OpcodeKind::Var, 28),
            CopyTable => (OpcodeKind::Var, 29),
            PrintTable => (OpcodeKind::Var, 30),
            CheckArgCount => (OpcodeKind::Var, 31),
            SaveExt => (OpcodeKind::Ext, 0),
            RestoreExt => (OpcodeKind::Ext, 1),
            LogShift => (OpcodeKind::Ext, 2),
            ArtShift => (OpcodeKind::Ext, 3),
            SetFont => (OpcodeKind::Ext, 4),
            DrawPicture => (OpcodeKind::Ext, 5),
            PictureData => (OpcodeKind::Ext, 6),
            ErasePicture => (OpcodeKind::Ext, 7),
            SetMargins => (OpcodeKind::Ext, 8),
            SaveUndo => (OpcodeKind::Ext, 9),
            RestoreUndo => (OpcodeKind::Ext, 10),
            PrintUnicode => (OpcodeKind::Ext, 11),
            CheckUnicode => (OpcodeKind::Ext, 12),
            SetTrueColour => (OpcodeKind::Ext, 13),
            Unknown(kind, number) => (kind, number),
        };
        if kind == OpcodeKind::Ext && version < 5 {
            return None;
        }
        (Self::lookup(kind, number, version) == self).then_some((kind, number))
    }

    /// Whether a store-variable byte follows the operands.
    pub const fn has_store(self, version: u8) -> bool {
        use Opcode::*;
        match self {
            Or | And | Loadw | Loadb | GetProp | GetPropAddr | GetNextProp | Add | Sub | Mul
            | Div | Mod | Call2S | GetSibling | GetChild | GetParent | GetPropLen | Call1S
            | Load | Not | Catch | CallVS | Aread | Random | CallVS2 | ReadChar | ScanTable
            | SaveExt | RestoreExt | LogShift | ArtShift | SetFont | SaveUndo | RestoreUndo
            | CheckUnicode => true,
            Save | Restore => version == 4,
            Pull => version == 6,
            _ => false,
        }
    }

    /// Whether branch bytes follow the operands (and store).
    pub const fn has_branch(self, version: u8) -> bool {
        use Opcode::*;
        match self {
            Je | Jl | Jg | DecChk | IncChk | Jin | Test | TestAttr | Jz | GetSibling
            | GetChild | Verify | Piracy | ScanTable | CheckArgCount | PictureData => true,
            Save | Restore => version <= 3,
            _ => false,
        }
    }

    /// Whether encoded text is embedded after the instruction.
    #[inline]
    pub const fn has_text(self) -> bool {
        matches!(self, Opcode::Print | Opcode::PrintRet)
    }

    /// Whether this opcode calls a routine.
    #[inline]
    pub const fn is_call(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Call1S | Call1N | Call2S | Call2N | CallVS | CallVN | CallVS2 | CallVN2
        )
    }

    /// Whether the variable form carries two kind bytes.
    #[inline]
    pub const fn is_double_variable(self) -> bool {
        matches!(self, Opcode::CallVS2 | Opcode::CallVN2)
    }

    /// Whether the first operand names a variable by number.
    #[inline]
    pub const fn has_indirect_variable(self) -> bool {
        use Opcode::*;
        matches!(self, Inc | Dec | IncChk | DecChk | Store | Load | Pull)
    }

    /// Whether control never falls through to the next instruction.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Rtrue | Rfalse | PrintRet | RetPopped | Ret | Jump | Quit | Restart | Throw
        )
    }

    /// Whether this opcode leaves the current routine.
    #[inline]
    pub const fn is_return(self) -> bool {
        use Opcode::*;
        matches!(self, Rtrue | Rfalse | PrintRet | RetPopped | Ret | Throw)
    }

    /// Assembly mnemonic
    pub const fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Je => "je",
            Jl => "jl",
            Jg => "jg",
            DecChk => "dec_chk",
            IncChk => "inc_chk",
            Jin => "jin",
            Test => "test",
            Or => "or",
            And => "and",
            TestAttr => "test_attr",
            SetAttr => "set_attr",
            ClearAttr => "clear_attr",
            Store => "store",
            InsertObj => "insert_obj",
            Loadw => "loadw",
            Loadb => "loadb",
            GetProp => "get_prop",
            GetPropAddr => "get_prop_addr",
            GetNextProp => "get_next_prop",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Call2S => "call_2s",
            Call2N => "call_2n",
            SetColour => "set_colour",
            Throw => "throw",
            Jz => "jz",
            GetSibling => "get_sibling",
            GetChild => "get_child",
            GetParent => "get_parent",
            GetPropLen => "get_prop_len",
            Inc => "inc",
            Dec => "dec",
            PrintAddr => "print_addr",
            Call1S => "call_1s",
            RemoveObj => "remove_obj",
            PrintObj => "print_obj",
            Ret => "ret",
            Jump => "jump",
            PrintPaddr => "print_paddr",
            Load => "load",
            Not => "not",
            Call1N => "call_1n",
            Rtrue => "rtrue",
            Rfalse => "rfalse",
            Print => "print",
            PrintRet => "print_ret",
            Nop => "nop",
            Save => "save",
            Restore => "restore",
            Restart => "restart",
            RetPopped => "ret_popped",
            Pop => "pop",
            Catch => "catch",
            Quit => "quit",
            NewLine => "new_line",
            ShowStatus => "show_status",
            Verify => "verify",
            Piracy => "piracy",
            CallVS => "call_vs",
            Storew => "storew",
            Storeb => "storeb",
            PutProp => "put_prop",
            Sread => "sread",
            Aread => "aread",
            PrintChar => "print_char",
            PrintNum => "print_num",
            Random => "random",
            Push => "push",
            Pull => "pull",
            SplitWindow => "split_window",
            SetWindow => "set_window",
            CallVS2 => "call_vs2",
            EraseWindow => "erase_window",
            EraseLine => "erase_line",
            SetCursor => "set_cursor",
            GetCursor => "get_cursor",
            SetTextStyle => "set_text_style",
            BufferMode => "buffer_mode",
            OutputStream => "output_stream",
            InputStream => "input_stream",
            SoundEffect => "sound_effect",
            ReadChar => "read_char",
            ScanTable => "scan_table",
            CallVN => "call_vn",
            CallVN2 => "call_vn2",
            Tokenise => "tokenise",
            EncodeText => "encode_text",
            CopyTable => "copy_table",
            PrintTable => "print_table",
            CheckArgCount => "check_arg_count",
            SaveExt => "save",
            RestoreExt => "restore",
            LogShift => "log_shift",
            ArtShift => "art_shift",
            SetFont => "set_font",
            DrawPicture => "draw_picture",
            PictureData => "picture_data",
            ErasePicture => "erase_picture",
            SetMargins => "set_margins",
            SaveUndo => "save_undo",
            RestoreUndo => "restore_undo",
            PrintUnicode => "print_unicode",
            CheckUnicode => "check_unicode",
            SetTrueColour => "set_true_colour",
            Unknown(..) => "unknown",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Unknown(kind, number) => write!(f, "unknown_{kind}_{number}"),
            other => f.write_str(other.name()),
        }
    }
}
