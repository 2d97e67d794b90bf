use serde::{Deserialize, Serialize};

/// Language of status messages and evidence file labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    Ja,
    En,
}

/// Every user facing string the crate emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Text {
    DownloadSkipped,
    DownloadAlreadyDone,
    DownloadStarting,
    DownloadStalled,
    DownloadComplete,
    SamplingUnrestricted,
    SamplingLimitReached,
    SamplingProgressAbort,
    SamplingRoundFailed,
    SamplingScratchCleanup,
    SamplingScratchCleanupFailed,
    SamplingPeerCount,
    SamplingWritingLogs,
    NoReadPieceAlert,
    PieceBlank,
    PieceHashMismatch,
    PieceContentMismatch,
    PieceVerified,
    RosterPermission,
    RosterNotNumeric,
    LookupReset,
    LookupSocket,
    LookupUnknown,
    LookupNotManaged,
    NotFetched,
    PublicIpv4Failed,
    PublicIpv6Failed,
    NoPeers,
    CollectionDone,
    TorrentRegistered,
    // evidence file labels
    LabelIp,
    LabelPort,
    LabelClient,
    LabelProvider,
    LabelFileName,
    LabelFileHash,
    LabelStart,
    LabelTool,
    LabelSpeed,
    LabelCompleted,
    CorruptPieceSeen,
    LogBlank,
    LogHashMismatch,
    LogContentMismatch,
    RegisterTarget,
    RegisterMethod,
    RegisterManual,
    RegisterSource,
    RegisterCreated,
}

impl Locale {
    pub fn text(self, key: Text) -> &'static str {
        match self {
            Locale::Ja => ja(key),
            Locale::En => en(key),
        }
    }
}

fn ja(key: Text) -> &'static str {
    use Text::*;
    match key {
        DownloadSkipped => "本体ファイルのダウンロードをスキップ",
        DownloadAlreadyDone => "本体ファイルDL済",
        DownloadStarting => "本体ファイルのダウンロードを行います",
        DownloadStalled => "ダウンロードが進捗していないため、スキップします。",
        DownloadComplete => "本体ファイルのダウンロードが完了しました",
        SamplingUnrestricted => "IP範囲ファイルがないため、すべてのシーダーを収録します。",
        SamplingLimitReached => "取得ピア数の上限に達しました。",
        SamplingProgressAbort => "ダウンロードの進捗が上限を超えたため、ピア取得を中断します。",
        SamplingRoundFailed => "ループ中に例外が発生",
        SamplingScratchCleanup => "一時ファイルの削除を試行中...",
        SamplingScratchCleanupFailed => "一時ファイルの削除に失敗しました",
        SamplingPeerCount => "取得ピア数",
        SamplingWritingLogs => "ログを記録しています...",
        NoReadPieceAlert => "read_piece_alert が受信されませんでした。",
        PieceBlank => "ピースサイズが0でした。通信エラーがあった可能性があります。",
        PieceHashMismatch => {
            "ダウンロードしたピースのハッシュが一致しません。ピースが破損している可能性があります。"
        }
        PieceContentMismatch => {
            "ダウンロードしたピースのバイナリが一致しません。Torrentファイル、または本体ファイルの内容が不正な可能性があります。"
        }
        PieceVerified => "ピースのダウンロードに成功",
        RosterPermission => {
            "パーミッションエラー：ピア履歴のcsvに書き込みできません。ファイルが開かれている場合は閉じてください。"
        }
        RosterNotNumeric => "csvデータ上の値が数値ではないため、書き込みできませんでした。",
        LookupReset => "取得失敗（Whoisサーバーからの拒否）",
        LookupSocket => "取得失敗（ソケットエラー）",
        LookupUnknown => "取得失敗（不明）",
        LookupNotManaged => "取得失敗(JPNIC管理外)",
        NotFetched => "未取得",
        PublicIpv4Failed => "IPv4の取得に失敗しました",
        PublicIpv6Failed => "IPv6の取得に失敗しました",
        NoPeers => "対象となるピアがありませんでした。",
        CollectionDone => "ピース収集が完了しました。",
        TorrentRegistered => "証拠フォルダを作成しました",
        LabelIp => "IPアドレス：",
        LabelPort => "ポート番号：",
        LabelClient => "クライアント：",
        LabelProvider => "プロバイダ：",
        LabelFileName => "ファイル名：",
        LabelFileHash => "ファイルハッシュ: ",
        LabelStart => "証拠収集開始時刻: ",
        LabelTool => "P2Pクローラ ",
        LabelSpeed => "速度：",
        LabelCompleted => "完了時刻: ",
        CorruptPieceSeen => "破損ピース：あり",
        LogBlank => " エラー：ピースダウンロード失敗 ",
        LogHashMismatch => " エラー：ピースハッシュ不一致 ",
        LogContentMismatch => " エラー：バイナリ不一致 ",
        RegisterTarget => "対象ファイル名：",
        RegisterMethod => "取得方法：",
        RegisterManual => "手動登録",
        RegisterSource => "取得元：",
        RegisterCreated => "フォルダ作成日時：",
    }
}

fn en(key: Text) -> &'static str {
    use Text::*;
    match key {
        DownloadSkipped => "skipping content download",
        DownloadAlreadyDone => "content already downloaded",
        DownloadStarting => "downloading content",
        DownloadStalled => "download made no progress, giving up for now",
        DownloadComplete => "content download complete",
        SamplingUnrestricted => "no ip range files, accepting every seeding peer",
        SamplingLimitReached => "peer sample size reached",
        SamplingProgressAbort => "own progress passed the limit, stopping peer sampling",
        SamplingRoundFailed => "error during sampling round",
        SamplingScratchCleanup => "removing scratch files...",
        SamplingScratchCleanupFailed => "failed to remove scratch files",
        SamplingPeerCount => "peers found",
        SamplingWritingLogs => "writing logs...",
        NoReadPieceAlert => "no read piece alert received",
        PieceBlank => "piece was empty, the transfer probably failed",
        PieceHashMismatch => "piece hash does not match, the piece may be corrupt",
        PieceContentMismatch => {
            "piece bytes do not match the content, the torrent or content may be forged"
        }
        PieceVerified => "piece verified",
        RosterPermission => "permission error: cannot write the peer roster csv, close it if it is open",
        RosterNotNumeric => "roster value is not a number, row left unchanged",
        LookupReset => "lookup failed (connection reset by whois server)",
        LookupSocket => "lookup failed (socket error)",
        LookupUnknown => "lookup failed (unknown)",
        LookupNotManaged => "lookup failed (not managed by registry)",
        NotFetched => "not fetched",
        PublicIpv4Failed => "failed to resolve public IPv4",
        PublicIpv6Failed => "failed to resolve public IPv6",
        NoPeers => "no qualifying peers",
        CollectionDone => "piece collection complete",
        TorrentRegistered => "evidence folder created",
        LabelIp => "IP address: ",
        LabelPort => "Port: ",
        LabelClient => "Client: ",
        LabelProvider => "Provider: ",
        LabelFileName => "File name: ",
        LabelFileHash => "Info hash: ",
        LabelStart => "Collection started: ",
        LabelTool => "P2P crawler ",
        LabelSpeed => "speed: ",
        LabelCompleted => "completed: ",
        CorruptPieceSeen => "corrupt piece: yes",
        LogBlank => " error: piece download failed ",
        LogHashMismatch => " error: piece hash mismatch ",
        LogContentMismatch => " error: content mismatch ",
        RegisterTarget => "Target: ",
        RegisterMethod => "Acquired by: ",
        RegisterManual => "manual registration",
        RegisterSource => "Source: ",
        RegisterCreated => "Folder created: ",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locales_differ() {
        assert_ne!(Locale::Ja.text(Text::PieceBlank), Locale::En.text(Text::PieceBlank));
        assert_eq!(Locale::default(), Locale::Ja);
    }

    #[test]
    fn parses_from_settings_value() {
        let locale: Locale = serde_json::from_str("\"en\"").unwrap();
        assert_eq!(locale, Locale::En);
    }
}
